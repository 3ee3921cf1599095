pub mod serial;
pub mod at;
pub mod device;
pub mod config;
pub mod payload;

pub use at::{CommandResponse, CommandResult, Downlink, ModemEvent, RxSlot, TerminalDialect};
pub use config::{ModemConfig, SerialSettings};
pub use device::{
    join_with_retry, DeviceError, DeviceState, JoinOutcome, JoinParams, JoinRetryPolicy, LoraWanModem,
    ModemEventHandler,
};
pub use serial::{SerialDeviceInfo, SerialInterface};
