use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::{ModemEventHandler, SessionEvents};
use super::models::{
    check_port, AbpCredentials, Band, DeviceClass, DeviceState, JoinMode, JoinParams, OtaaCredentials, QueryValue,
};
use super::{DeviceError, Result};
use crate::at::reader::reader_task;
use crate::at::{CommandResponse, CommandResult, CommandSpec, Correlator, LineProcessor, MetricsSnapshot, ModemEvent};
use crate::config::ModemConfig;
use crate::payload;
use crate::serial::{LineReader, LineWriter, SerialInterface, StreamLineReader, StreamLineWriter};

/// One session with a LoRaWAN AT modem.
///
/// Owns the transport and the background line processor. Commands are
/// single-flight: issuing a second one while the first is still waiting
/// fails with [`crate::at::AtError::CommandInFlight`]. Every device-side
/// outcome, including timeout, is returned as a [`CommandResult`].
pub struct LoraWanModem {
    id: Uuid,
    config: ModemConfig,
    correlator: Arc<Correlator>,
    events: Arc<SessionEvents>,
    metrics_rx: watch::Receiver<MetricsSnapshot>,
    stop_tx: watch::Sender<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl LoraWanModem {
    /// Open the configured serial port and start the line processor
    pub fn open(config: ModemConfig) -> Result<Self> {
        config.validate()?;
        let (reader, writer) = SerialInterface::open(&config.serial)?;
        Self::from_transport(reader, writer, config)
    }

    /// Run a session over any byte stream (TCP bridge, pty, in-memory pipe)
    pub fn from_stream<S>(stream: S, config: ModemConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_transport(StreamLineReader::new(read_half), StreamLineWriter::new(write_half), config)
    }

    /// Must be called from within a tokio runtime; the line processor is spawned here.
    pub fn from_transport<R, W>(reader: R, writer: W, config: ModemConfig) -> Result<Self>
    where
        R: LineReader + 'static,
        W: LineWriter + 'static,
    {
        config.validate()?;

        let id = Uuid::new_v4();
        let label = id.to_string();
        let (metrics_tx, metrics_rx) = watch::channel(MetricsSnapshot::default());
        let metrics_tx = Arc::new(metrics_tx);

        let correlator = Arc::new(Correlator::new(
            label.clone(),
            Box::new(writer),
            metrics_tx.clone(),
            config.late_reply_grace(),
        ));
        let events = Arc::new(SessionEvents::new(label.clone(), config.event_capacity));
        let processor = LineProcessor::new(
            label,
            config.dialect,
            config.frame_line_timeout(),
            correlator.clone(),
            events.clone(),
            metrics_tx,
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(reader_task(processor, Box::new(reader), stop_rx, config.idle_read_timeout()));

        log::info!("[{}] Modem session started ({:?} dialect)", id, config.dialect);

        Ok(Self {
            id,
            config,
            correlator,
            events,
            metrics_rx,
            stop_tx,
            reader_task: Mutex::new(Some(task)),
        })
    }

    pub fn with_event_handler(self, handler: Arc<dyn ModemEventHandler>) -> Self {
        self.events.set_handler(Some(handler));
        self
    }

    /// Register, replace or clear (`None`) the event handler
    pub fn set_event_handler(&self, handler: Option<Arc<dyn ModemEventHandler>>) {
        self.events.set_handler(handler);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.events.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<DeviceState> {
        self.events.state_receiver()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ModemEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_rx.borrow().clone()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<MetricsSnapshot> {
        self.metrics_rx.clone()
    }

    pub fn has_pending_command(&self) -> bool {
        self.correlator.has_pending()
    }

    /// Send a raw command line and wait for its terminal status
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult> {
        let response = self.correlator.execute(command, CommandSpec::status(command, timeout)).await?;
        Ok(response.result)
    }

    /// Send a command that answers with value lines before its status
    pub async fn query(&self, command: &str, timeout: Duration) -> Result<CommandResponse> {
        Ok(self.correlator.execute(command, CommandSpec::query(command, timeout)).await?)
    }

    async fn run(&self, command: &str) -> Result<CommandResult> {
        self.execute(command, self.config.command_timeout()).await
    }

    async fn query_value(&self, name: &str) -> Result<QueryValue> {
        let response = self.query(&format!("{}=?", name), self.config.command_timeout()).await?;
        let value = response.value(name).map(str::to_string);
        Ok(QueryValue { result: response.result, value })
    }

    /// Put the modem into LoRaWAN mode
    pub async fn initialise(&self) -> Result<CommandResult> {
        let command = self.config.work_mode_command.clone();
        let result = self.run(&command).await?;
        if result.is_success() {
            self.events.transition(|state| (state == DeviceState::Uninitialised).then_some(DeviceState::Initialised));
        } else {
            log::warn!("[{}] Work mode command rejected: {}", self.id, result);
        }
        Ok(result)
    }

    pub async fn set_class(&self, class: DeviceClass) -> Result<CommandResult> {
        self.run(&format!("AT+CLASS={}", class.as_at_value())).await
    }

    pub async fn set_band(&self, band: Band) -> Result<CommandResult> {
        self.run(&format!("AT+BAND={}", band.as_at_value())).await
    }

    pub async fn set_adr(&self, enabled: bool) -> Result<CommandResult> {
        self.run(&format!("AT+ADR={}", u8::from(enabled))).await
    }

    /// Confirmed (`true`) or unconfirmed uplinks
    pub async fn set_confirm_mode(&self, confirmed: bool) -> Result<CommandResult> {
        self.run(&format!("AT+CFM={}", u8::from(confirmed))).await
    }

    pub async fn set_join_mode(&self, mode: JoinMode) -> Result<CommandResult> {
        self.run(&format!("AT+NJM={}", mode.as_at_value())).await
    }

    pub async fn configure_otaa(&self, credentials: &OtaaCredentials) -> Result<CommandResult> {
        credentials.validate()?;
        self.run_sequence(&credentials.to_commands()).await
    }

    pub async fn configure_abp(&self, credentials: &AbpCredentials) -> Result<CommandResult> {
        credentials.validate()?;
        self.run_sequence(&credentials.to_commands()).await
    }

    /// Stops at the first command that does not succeed and returns its result
    async fn run_sequence(&self, commands: &[String]) -> Result<CommandResult> {
        for command in commands {
            let result = self.run(command).await?;
            if !result.is_success() {
                log::warn!("[{}] '{}' failed: {}", self.id, command, result);
                return Ok(result);
            }
        }
        Ok(CommandResult::Success)
    }

    /// Ask the modem to join. `Success` means the request was accepted; the
    /// outcome arrives later as a join event and moves [`Self::state`].
    ///
    /// Only an initialised session (or one whose last join failed, or a rejoin
    /// from `Joined`) enters `Joining`; from any other state the command is
    /// still sent but the state is left alone.
    pub async fn join(&self, params: &JoinParams) -> Result<CommandResult> {
        params.validate()?;

        let previous = self.state();
        let entered = matches!(
            previous,
            DeviceState::Initialised | DeviceState::JoinFailed | DeviceState::Joined
        );
        if entered {
            self.events.transition(|state| (state == previous).then_some(DeviceState::Joining));
        }
        let outcome = self.run(&params.to_command()).await;

        let accepted = matches!(&outcome, Ok(result) if result.is_success());
        if entered && !accepted {
            self.events.transition(|state| (state == DeviceState::Joining).then_some(previous));
        }
        outcome
    }

    /// Send hex text on `port` (1..=223)
    pub async fn send_hex(&self, port: u8, payload_hex: &str) -> Result<CommandResult> {
        check_port(port)?;
        let payload_hex = payload_hex.trim();
        if payload_hex.is_empty() {
            return Err(DeviceError::InvalidArgument("payload must not be empty".to_string()));
        }
        if !payload::is_hex(payload_hex) {
            return Err(DeviceError::InvalidArgument(format!(
                "payload must be an even number of hex characters, got {:?}",
                payload_hex
            )));
        }

        let command = format!("AT+SEND={}:{}", port, payload_hex.to_ascii_uppercase());
        self.events.transition(|state| (state == DeviceState::Joined).then_some(DeviceState::Sending));
        let outcome = self.run(&command).await;
        self.events.transition(|state| (state == DeviceState::Sending).then_some(DeviceState::Joined));
        outcome
    }

    pub async fn send_bytes(&self, port: u8, payload: &[u8]) -> Result<CommandResult> {
        check_port(port)?;
        if payload.is_empty() {
            return Err(DeviceError::InvalidArgument("payload must not be empty".to_string()));
        }
        self.send_hex(port, &payload::bytes_to_hex(payload)).await
    }

    pub async fn firmware_version(&self) -> Result<QueryValue> {
        self.query_value("AT+VER").await
    }

    pub async fn device_eui(&self) -> Result<QueryValue> {
        self.query_value("AT+DEVEUI").await
    }

    fn take_reader_task(&self) -> Option<JoinHandle<()>> {
        self.reader_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }

    /// Longest dispose waits for the line processor before aborting it
    fn dispose_deadline(&self) -> Duration {
        self.config.idle_read_timeout() + self.config.frame_line_timeout() * 2
    }

    /// Stop the line processor and close the transport. A caller waiting on
    /// a command receives [`CommandResult::Disposed`]. Safe to call more than once.
    pub async fn dispose(&self) {
        let task = self.take_reader_task();

        self.events.set_state(DeviceState::Disposed);
        if self.correlator.close() {
            log::debug!("[{}] Released pending command on dispose", self.id);
        }
        let _ = self.stop_tx.send(true);

        if let Some(mut task) = task {
            if tokio::time::timeout(self.dispose_deadline(), &mut task).await.is_err() {
                log::warn!("[{}] Line processor did not stop in time, aborting", self.id);
                task.abort();
            }
            log::info!("[{}] Modem session disposed", self.id);
        }

        self.correlator.close_writer().await;
    }
}

impl Drop for LoraWanModem {
    fn drop(&mut self) {
        if let Some(task) = self.take_reader_task() {
            log::debug!("[{}] Session dropped without dispose", self.id);
            self.events.set_state(DeviceState::Disposed);
            self.correlator.close();
            let _ = self.stop_tx.send(true);
            task.abort();
        }
    }
}
