//! Downlink frame assembly.
//!
//! A downlink arrives as three lines:
//!
//! ```text
//! +EVT:RX_1, RSSI -42, SNR 7
//! +EVT:UNICAST
//! +EVT:10:48656C6C6F
//! ```
//!
//! The header carries signal quality at fixed field positions, the middle
//! line is discarded and the last line carries `marker:port:payload`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field positions after splitting the header on whitespace and commas
const RSSI_FIELD: usize = 2;
const SNR_FIELD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RxSlot {
    Rx1,
    Rx2,
    Rx3,
    ClassC,
}

impl RxSlot {
    pub const MARKERS: [(&'static str, RxSlot); 4] = [
        ("+EVT:RX_1", RxSlot::Rx1),
        ("+EVT:RX_2", RxSlot::Rx2),
        ("+EVT:RX_3", RxSlot::Rx3),
        ("+EVT:RX_C", RxSlot::ClassC),
    ];

    pub fn from_header(line: &str) -> Option<RxSlot> {
        Self::MARKERS
            .iter()
            .find(|(marker, _)| line.starts_with(marker))
            .map(|(_, slot)| *slot)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Downlink {
    pub slot: RxSlot,
    pub port: u8,
    pub rssi: i16,
    pub snr: i16,
    /// Uppercase hex text as delivered by the modem
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl Downlink {
    pub fn payload_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Downlink header field {field} missing in {line:?}")]
    MissingField { field: &'static str, line: String },

    #[error("Downlink field {field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Downlink payload is not hex text: {0:?}")]
    InvalidPayload(String),

    #[error("Downlink frame truncated after {received} of 3 lines")]
    Truncated { received: usize },
}

/// Signal quality carried by the header line
pub fn parse_header(line: &str) -> Result<(i16, i16), FrameError> {
    let fields: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|f| !f.is_empty())
        .collect();

    let rssi = numeric_field(&fields, RSSI_FIELD, "rssi", line)?;
    let snr = numeric_field(&fields, SNR_FIELD, "snr", line)?;
    Ok((rssi, snr))
}

fn numeric_field(fields: &[&str], index: usize, field: &'static str, line: &str) -> Result<i16, FrameError> {
    let raw = fields
        .get(index)
        .ok_or_else(|| FrameError::MissingField { field, line: line.to_string() })?;
    raw.parse::<i16>()
        .map_err(|_| FrameError::InvalidNumber { field, value: raw.to_string() })
}

/// Port and hex payload from the `marker:port:payload` line
pub fn parse_payload_line(line: &str) -> Result<(u8, String), FrameError> {
    let parts: Vec<&str> = line.trim().split(':').collect();
    let port_raw = parts
        .get(1)
        .ok_or_else(|| FrameError::MissingField { field: "port", line: line.to_string() })?;
    let payload = parts
        .get(2)
        .ok_or_else(|| FrameError::MissingField { field: "payload", line: line.to_string() })?;

    let port = port_raw
        .trim()
        .parse::<u8>()
        .map_err(|_| FrameError::InvalidNumber { field: "port", value: port_raw.to_string() })?;

    let payload = payload.trim();
    if payload.len() % 2 != 0 || !payload.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(FrameError::InvalidPayload(payload.to_string()));
    }

    Ok((port, payload.to_ascii_uppercase()))
}

/// Build a downlink from the header and the payload line
pub fn assemble(slot: RxSlot, header: &str, payload_line: &str) -> Result<Downlink, FrameError> {
    let (rssi, snr) = parse_header(header)?;
    let (port, payload) = parse_payload_line(payload_line)?;
    Ok(Downlink {
        slot,
        port,
        rssi,
        snr,
        payload,
        received_at: Utc::now(),
    })
}
