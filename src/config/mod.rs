//! Driver configuration, loadable from JSON.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::at::TerminalDialect;

pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const DEFAULT_WORK_MODE_COMMAND: &str = "AT+NWM=1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBitsSetting {
    Five,
    Six,
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParitySetting {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBitsSetting {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControlSetting {
    None,
    Software,
    Hardware,
}

impl From<DataBitsSetting> for tokio_serial::DataBits {
    fn from(value: DataBitsSetting) -> Self {
        match value {
            DataBitsSetting::Five => tokio_serial::DataBits::Five,
            DataBitsSetting::Six => tokio_serial::DataBits::Six,
            DataBitsSetting::Seven => tokio_serial::DataBits::Seven,
            DataBitsSetting::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<ParitySetting> for tokio_serial::Parity {
    fn from(value: ParitySetting) -> Self {
        match value {
            ParitySetting::None => tokio_serial::Parity::None,
            ParitySetting::Odd => tokio_serial::Parity::Odd,
            ParitySetting::Even => tokio_serial::Parity::Even,
        }
    }
}

impl From<StopBitsSetting> for tokio_serial::StopBits {
    fn from(value: StopBitsSetting) -> Self {
        match value {
            StopBitsSetting::One => tokio_serial::StopBits::One,
            StopBitsSetting::Two => tokio_serial::StopBits::Two,
        }
    }
}

impl From<FlowControlSetting> for tokio_serial::FlowControl {
    fn from(value: FlowControlSetting) -> Self {
        match value {
            FlowControlSetting::None => tokio_serial::FlowControl::None,
            FlowControlSetting::Software => tokio_serial::FlowControl::Software,
            FlowControlSetting::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Physical serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBitsSetting,
    pub parity: ParitySetting,
    pub stop_bits: StopBitsSetting,
    pub flow_control: FlowControlSetting,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBitsSetting::Eight,
            parity: ParitySetting::None,
            stop_bits: StopBitsSetting::One,
            flow_control: FlowControlSetting::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub serial: SerialSettings,
    /// Which terminal-line vocabulary the firmware speaks
    pub dialect: TerminalDialect,
    /// Default wait for a command's terminal line
    pub command_timeout_ms: u64,
    /// Bound on each idle read of the background processor; also bounds dispose latency
    pub idle_read_timeout_ms: u64,
    /// Wait for each follow-up line of a downlink frame
    pub frame_line_timeout_ms: u64,
    /// How long a timed-out command may still claim its late terminal line
    pub late_reply_grace_ms: u64,
    pub event_capacity: usize,
    /// Command sent by `initialise` to put the modem in LoRaWAN mode
    pub work_mode_command: String,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            dialect: TerminalDialect::default(),
            command_timeout_ms: 3000,
            idle_read_timeout_ms: 1000,
            frame_line_timeout_ms: 1000,
            late_reply_grace_ms: 10_000,
            event_capacity: 64,
            work_mode_command: DEFAULT_WORK_MODE_COMMAND.to_string(),
        }
    }
}

impl ModemConfig {
    pub fn for_port(port_name: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.serial.port_name = port_name.into();
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        log::debug!("Loaded modem configuration from {}", path.display());
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("command_timeout_ms", self.command_timeout_ms),
            ("idle_read_timeout_ms", self.idle_read_timeout_ms),
            ("frame_line_timeout_ms", self.frame_line_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be greater than zero".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be greater than zero".to_string()));
        }
        let command = self.work_mode_command.trim();
        if command.is_empty() || command.contains(['\r', '\n']) {
            return Err(ConfigError::Invalid("work_mode_command must be a single non-empty line".to_string()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_read_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_read_timeout_ms)
    }

    pub fn frame_line_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_line_timeout_ms)
    }

    pub fn late_reply_grace(&self) -> Duration {
        Duration::from_millis(self.late_reply_grace_ms)
    }
}
