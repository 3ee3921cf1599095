#![allow(dead_code)]

use std::time::Duration;

use lorawan_at_modem::{LoraWanModem, ModemConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

/// Device side of an in-memory serial link
pub struct FakeModem {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeModem {
    /// Next command line the host wrote, without its CRLF
    pub async fn expect_command(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("host wrote a command in time")
            .expect("link readable")
            .expect("link open")
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{}\r\n", line).as_bytes()).await.expect("write to host");
        self.writer.flush().await.expect("flush to host");
    }

    pub async fn send_all(&mut self, lines: &[&str]) {
        for line in lines {
            self.send(line).await;
        }
    }

    /// Nothing is written by the host for `window`
    pub async fn assert_silent(&mut self, window: Duration) {
        let next = tokio::time::timeout(window, self.lines.next_line()).await;
        assert!(next.is_err(), "host unexpectedly wrote {:?}", next);
    }

    /// Hang up the device side
    pub fn unplug(self) {}
}

pub fn test_config() -> ModemConfig {
    ModemConfig {
        idle_read_timeout_ms: 100,
        frame_line_timeout_ms: 500,
        ..ModemConfig::default()
    }
}

pub fn connect(config: ModemConfig) -> (LoraWanModem, FakeModem) {
    let (host, device) = tokio::io::duplex(4096);
    let modem = LoraWanModem::from_stream(host, config).expect("session starts");
    let (read_half, writer) = tokio::io::split(device);
    let fake = FakeModem {
        lines: BufReader::new(read_half).lines(),
        writer,
    };
    (modem, fake)
}

pub const SHORT: Duration = Duration::from_millis(200);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
