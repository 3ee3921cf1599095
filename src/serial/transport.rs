//! Line-oriented transport over any async byte stream.
//!
//! The read half is owned by the background line processor and the write half
//! by the command issuer, each behind its own trait.
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::Result;

/// Unterminated input beyond this many bytes is dropped.
pub const MAX_PARTIAL_LINE: usize = 4096;

const READ_CHUNK: usize = 256;

/// Result of a single bounded line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line with its terminator stripped.
    Line(String),
    /// No complete line arrived within the timeout.
    TimedOut,
    /// The peer closed the stream.
    Closed,
}

#[async_trait]
pub trait LineReader: Send {
    /// Read the next non-empty line, waiting at most `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> Result<ReadOutcome>;
}

#[async_trait]
pub trait LineWriter: Send {
    /// Write `line` followed by CRLF and flush.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Flush and shut down the write side.
    async fn close(&mut self) -> Result<()>;
}

pub struct StreamLineReader<R> {
    inner: R,
    partial: Vec<u8>,
    lines: VecDeque<String>,
}

impl<R> StreamLineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            partial: Vec::with_capacity(READ_CHUNK),
            lines: VecDeque::new(),
        }
    }

    /// Number of buffered bytes that have not yet formed a line.
    pub fn buffered_len(&self) -> usize {
        self.partial.len()
    }

    fn split_lines(&mut self) {
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line: Vec<u8> = self.partial.drain(..pos).collect();
            let mut advance = 0;
            while advance < self.partial.len() && (self.partial[advance] == b'\n' || self.partial[advance] == b'\r') {
                advance += 1;
            }
            self.partial.drain(..advance);

            let text = match String::from_utf8(line) {
                Ok(text) => text,
                Err(e) => {
                    log::debug!("Non UTF-8 bytes in serial line, decoding lossily");
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            };
            let text = text.trim();
            if !text.is_empty() {
                self.lines.push_back(text.to_string());
            }
        }

        if self.partial.len() > MAX_PARTIAL_LINE {
            log::warn!("Dropping {} bytes of unterminated serial input", self.partial.len());
            self.partial.clear();
        }
    }
}

#[async_trait]
impl<R> LineReader for StreamLineReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_line(&mut self, timeout: Duration) -> Result<ReadOutcome> {
        if let Some(line) = self.lines.pop_front() {
            return Ok(ReadOutcome::Line(line));
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match tokio::time::timeout_at(deadline, self.inner.read(&mut buf)).await {
                Err(_) => return Ok(ReadOutcome::TimedOut),
                Ok(Ok(0)) => return Ok(ReadOutcome::Closed),
                Ok(Ok(n)) => {
                    self.partial.extend_from_slice(&buf[..n]);
                    self.split_lines();
                    if let Some(line) = self.lines.pop_front() {
                        return Ok(ReadOutcome::Line(line));
                    }
                }
                // Native serial drivers report their own read timeout as an error
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if Instant::now() >= deadline {
                        return Ok(ReadOutcome::TimedOut);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

pub struct StreamLineWriter<W> {
    inner: W,
}

impl<W> StreamLineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> LineWriter for StreamLineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut framed = String::with_capacity(line.len() + 2);
        framed.push_str(line);
        framed.push_str("\r\n");
        self.inner.write_all(framed.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
