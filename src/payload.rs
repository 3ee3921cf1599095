//! Payload conversion at the modem boundary: binary <-> uppercase hex pairs.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid hex payload: {0}")]
    Hex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, PayloadError>;

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decode hex text; odd length or non-hex characters are rejected
pub fn hex_to_bytes(text: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(text.trim())?)
}

pub fn is_hex(text: &str) -> bool {
    text.len() % 2 == 0 && text.chars().all(|c| c.is_ascii_hexdigit())
}
