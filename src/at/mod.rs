//! AT command engine: line classification, status translation, command
//! correlation and the background line processor.
pub mod classifier;
pub mod codes;
pub mod correlator;
pub mod frame;
pub mod reader;
pub mod types;

pub use classifier::{classify, LineClass};
pub use codes::TerminalDialect;
pub use correlator::{Completion, Correlator};
pub use frame::{Downlink, FrameError, RxSlot};
pub use reader::{EventSink, LineDisposition, LineProcessor};
pub use types::{CommandResponse, CommandResult, CommandSpec, MetricsSnapshot, ModemEvent};

use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum AtError {
    #[error("Command already in flight: {0}")]
    CommandInFlight(String),

    #[error("Modem session disposed")]
    Disposed,

    #[error("Invalid command text: {0:?}")]
    InvalidCommand(String),

    #[error("Serial communication error: {0}")]
    Serial(#[from] SerialError),
}

pub type Result<T> = std::result::Result<T, AtError>;
