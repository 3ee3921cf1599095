use serde::{Deserialize, Serialize};

use super::{DeviceError, Result};
use crate::payload;

/// Lowest and highest application port accepted for uplinks
pub const MIN_APP_PORT: u8 = 1;
pub const MAX_APP_PORT: u8 = 223;

pub const MIN_JOIN_INTERVAL_SECS: u8 = 7;

/// Session lifecycle as observed by the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Background processor running, work mode not yet accepted
    Uninitialised,
    Initialised,
    Joining,
    Joined,
    JoinFailed,
    Sending,
    Disposed,
}

impl DeviceState {
    pub fn is_joined(&self) -> bool {
        matches!(self, DeviceState::Joined | DeviceState::Sending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    A,
    B,
    C,
}

impl DeviceClass {
    pub fn as_at_value(&self) -> &'static str {
        match self {
            DeviceClass::A => "A",
            DeviceClass::B => "B",
            DeviceClass::C => "C",
        }
    }
}

/// Regional band plan as numbered by the modem firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Band {
    Eu433,
    Cn470,
    Ru864,
    In865,
    Eu868,
    Us915,
    Au915,
    Kr920,
    As923_1,
    As923_2,
    As923_3,
    As923_4,
    La915,
}

impl Band {
    pub fn as_at_value(&self) -> &'static str {
        match self {
            Band::Eu433 => "0",
            Band::Cn470 => "1",
            Band::Ru864 => "2",
            Band::In865 => "3",
            Band::Eu868 => "4",
            Band::Us915 => "5",
            Band::Au915 => "6",
            Band::Kr920 => "7",
            Band::As923_1 => "8-1",
            Band::As923_2 => "8-2",
            Band::As923_3 => "8-3",
            Band::As923_4 => "8-4",
            Band::La915 => "12",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMode {
    Abp,
    Otaa,
}

impl JoinMode {
    pub fn as_at_value(&self) -> &'static str {
        match self {
            JoinMode::Abp => "0",
            JoinMode::Otaa => "1",
        }
    }
}

/// Arguments of `AT+JOIN=<join>:<auto>:<interval>:<attempts>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinParams {
    /// Rejoin automatically after the modem restarts
    pub auto_join: bool,
    /// Seconds between modem-side join attempts
    pub interval_secs: u8,
    /// Modem-side join attempts
    pub attempts: u8,
}

impl Default for JoinParams {
    fn default() -> Self {
        Self { auto_join: false, interval_secs: 10, attempts: 8 }
    }
}

impl JoinParams {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs < MIN_JOIN_INTERVAL_SECS {
            return Err(DeviceError::InvalidArgument(format!(
                "join interval {}s is below the {}s minimum",
                self.interval_secs, MIN_JOIN_INTERVAL_SECS
            )));
        }
        Ok(())
    }

    pub fn to_command(&self) -> String {
        format!("AT+JOIN=1:{}:{}:{}", u8::from(self.auto_join), self.interval_secs, self.attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaaCredentials {
    pub dev_eui: String,
    pub join_eui: String,
    pub app_key: String,
}

impl OtaaCredentials {
    pub fn validate(&self) -> Result<()> {
        check_hex_field("dev_eui", &self.dev_eui, 16)?;
        check_hex_field("join_eui", &self.join_eui, 16)?;
        check_hex_field("app_key", &self.app_key, 32)
    }

    pub fn to_commands(&self) -> Vec<String> {
        vec![
            format!("AT+DEVEUI={}", self.dev_eui.to_ascii_uppercase()),
            format!("AT+APPEUI={}", self.join_eui.to_ascii_uppercase()),
            format!("AT+APPKEY={}", self.app_key.to_ascii_uppercase()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbpCredentials {
    pub dev_addr: String,
    pub nwk_skey: String,
    pub app_skey: String,
}

impl AbpCredentials {
    pub fn validate(&self) -> Result<()> {
        check_hex_field("dev_addr", &self.dev_addr, 8)?;
        check_hex_field("nwk_skey", &self.nwk_skey, 32)?;
        check_hex_field("app_skey", &self.app_skey, 32)
    }

    pub fn to_commands(&self) -> Vec<String> {
        vec![
            format!("AT+DEVADDR={}", self.dev_addr.to_ascii_uppercase()),
            format!("AT+NWKSKEY={}", self.nwk_skey.to_ascii_uppercase()),
            format!("AT+APPSKEY={}", self.app_skey.to_ascii_uppercase()),
        ]
    }
}

/// Status of a `AT+XXX=?` query plus its value line, if the modem sent one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryValue {
    pub result: crate::at::CommandResult,
    pub value: Option<String>,
}

fn check_hex_field(name: &str, value: &str, expected_len: usize) -> Result<()> {
    if value.len() != expected_len || !payload::is_hex(value) {
        return Err(DeviceError::InvalidArgument(format!(
            "{} must be {} hex characters, got {:?}",
            name, expected_len, value
        )));
    }
    Ok(())
}

pub fn check_port(port: u8) -> Result<()> {
    if !(MIN_APP_PORT..=MAX_APP_PORT).contains(&port) {
        return Err(DeviceError::InvalidArgument(format!(
            "port {} outside {}..={}",
            port, MIN_APP_PORT, MAX_APP_PORT
        )));
    }
    Ok(())
}
