pub mod events;
pub mod manager;
pub mod models;
pub mod retry;

pub use events::ModemEventHandler;
pub use manager::LoraWanModem;
pub use models::*;
pub use retry::{join_with_retry, JoinOutcome, JoinRetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid payload: {0}")]
    Payload(#[from] crate::payload::PayloadError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Command error: {0}")]
    At(#[from] crate::at::AtError),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
