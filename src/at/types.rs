//! Core types shared by the correlator and the line processor
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::frame::Downlink;
use crate::serial::SerialError;

/// Outcome of one command invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    Success,
    /// No terminal line arrived within the command's window
    Timeout,
    Error,
    ParameterError,
    BusyError,
    ParameterOverflow,
    NotJoined,
    ReceiveError,
    DutyCycleRestricted,
    /// Numeric error code the translator does not know
    ResponseInvalid,
    /// A terminal line was expected but matched no known token
    Undefined(String),
    /// The session was disposed while the command was waiting
    Disposed,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandResult::Success)
    }

    /// The modem understood the command and reported a failure
    pub fn is_modem_error(&self) -> bool {
        matches!(
            self,
            CommandResult::Error
                | CommandResult::ParameterError
                | CommandResult::BusyError
                | CommandResult::ParameterOverflow
                | CommandResult::NotJoined
                | CommandResult::ReceiveError
                | CommandResult::DutyCycleRestricted
        )
    }

    /// Host and modem disagree about the protocol
    pub fn is_classification_failure(&self) -> bool {
        matches!(self, CommandResult::ResponseInvalid | CommandResult::Undefined(_))
    }

    /// Worth issuing again after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommandResult::Timeout | CommandResult::BusyError | CommandResult::DutyCycleRestricted
        )
    }
}

impl std::fmt::Display for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandResult::Success => write!(f, "success"),
            CommandResult::Timeout => write!(f, "timeout"),
            CommandResult::Error => write!(f, "modem error"),
            CommandResult::ParameterError => write!(f, "invalid parameter"),
            CommandResult::BusyError => write!(f, "modem busy"),
            CommandResult::ParameterOverflow => write!(f, "parameter overflow"),
            CommandResult::NotJoined => write!(f, "network not joined"),
            CommandResult::ReceiveError => write!(f, "receive error"),
            CommandResult::DutyCycleRestricted => write!(f, "duty cycle restricted"),
            CommandResult::ResponseInvalid => write!(f, "invalid response code"),
            CommandResult::Undefined(line) => write!(f, "unrecognized terminal line {:?}", line),
            CommandResult::Disposed => write!(f, "session disposed"),
        }
    }
}

/// Terminal result plus any value lines collected before it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub result: CommandResult,
    pub lines: Vec<String>,
}

impl CommandResponse {
    pub fn new(result: CommandResult) -> Self {
        Self { result, lines: Vec::new() }
    }

    /// Value of a `NAME=value` line, e.g. `value("AT+VER")` for `AT+VER=1.0.4`
    pub fn value(&self, name: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::trim)
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub timeout: Duration,
    /// Buffer non-status lines until the status token instead of resolving on the first line
    pub collect_values: bool,
}

impl CommandSpec {
    pub fn status(command: &str, timeout: Duration) -> Self {
        Self { name: command_name(command).to_string(), timeout, collect_values: false }
    }

    pub fn query(command: &str, timeout: Duration) -> Self {
        Self { name: command_name(command).to_string(), timeout, collect_values: true }
    }
}

/// `AT+BAND=8-1` -> `AT+BAND`
pub fn command_name(command: &str) -> &str {
    command.split(['=', '?']).next().unwrap_or(command).trim()
}

pub(crate) type Responder = oneshot::Sender<Result<CommandResponse, SerialError>>;

pub(crate) struct PendingCommand {
    pub generation: u64,
    pub command: String,
    pub spec: CommandSpec,
    pub started: Instant,
    pub responder: Responder,
    pub buffer: Vec<String>,
    /// An older timed-out command took a status line while this one was waiting
    pub reply_claimed: bool,
}

/// A command that timed out and may still receive a late terminal line
#[derive(Debug, Clone)]
pub(crate) struct AbandonedCommand {
    pub generation: u64,
    pub command: String,
    pub collect_values: bool,
    pub expires: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModemEvent {
    JoinCompleted { joined: bool },
    MessageConfirmed,
    MessageReceived(Downlink),
    ProtocolNotice { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub lines_read: u64,
    pub events_dispatched: u64,
    pub command_completed: u64,
    pub command_timeouts: u64,
    pub late_replies_discarded: u64,
    pub unsolicited_lines: u64,
    pub frame_errors: u64,
    pub last_error: Option<String>,
    pub command_last_latency_ms: Option<u64>,
    pub command_min_latency_ms: Option<u64>,
    pub command_max_latency_ms: Option<u64>,
    pub command_avg_latency_ms: Option<f64>,
    pub command_ema_latency_ms: Option<f64>,
    pub command_latency_samples: u64,
}

impl MetricsSnapshot {
    pub(crate) fn record_completion(&mut self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.command_completed += 1;
        self.command_latency_samples += 1;
        self.command_last_latency_ms = Some(latency_ms);
        self.command_min_latency_ms = Some(self.command_min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.command_max_latency_ms = Some(self.command_max_latency_ms.map_or(latency_ms, |m| m.max(latency_ms)));
        let samples = self.command_latency_samples as f64;
        self.command_avg_latency_ms = Some(match self.command_avg_latency_ms {
            Some(avg) if self.command_latency_samples > 1 => (avg * (samples - 1.0) + latency_ms as f64) / samples,
            _ => latency_ms as f64,
        });
        self.command_ema_latency_ms = Some(match self.command_ema_latency_ms {
            Some(prev) => prev * 0.8 + latency_ms as f64 * 0.2,
            None => latency_ms as f64,
        });
    }
}
