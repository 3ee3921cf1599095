//! Stateless classification of modem lines.
//!
//! Markers are matched as substrings or prefixes, never by equality, because
//! firmware revisions append extra text to event lines.
use super::codes::TerminalDialect;
use super::frame::RxSlot;
use super::types::CommandResult;

pub const JOIN_SUCCESS_MARKERS: &[&str] = &["+EVT:JOINED"];
pub const JOIN_FAILURE_MARKERS: &[&str] = &["+EVT:JOIN FAILED", "+EVT:JOIN_FAILED", "+EVT:FAILED"];
pub const CONFIRM_SUCCESS_MARKERS: &[&str] = &["+EVT:SEND CONFIRMED OK", "+EVT:SEND_CONFIRMED_OK"];
pub const CONFIRM_FAILURE_MARKERS: &[&str] = &["+EVT:SEND CONFIRMED FAILED", "+EVT:SEND_CONFIRMED_FAILED"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    JoinCompleted(bool),
    MessageConfirmed,
    /// Negative confirmation; recognised so it is never mistaken for a terminal line
    ConfirmationFailed,
    DownlinkHeader(RxSlot),
    Status(CommandResult),
    /// Terminal line of a pending command, or noise when nothing is pending
    Unmatched,
}

fn contains_any(line: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| line.contains(marker))
}

pub fn classify(line: &str, dialect: TerminalDialect) -> LineClass {
    if contains_any(line, JOIN_SUCCESS_MARKERS) {
        return LineClass::JoinCompleted(true);
    }
    if contains_any(line, JOIN_FAILURE_MARKERS) {
        return LineClass::JoinCompleted(false);
    }
    if contains_any(line, CONFIRM_SUCCESS_MARKERS) {
        return LineClass::MessageConfirmed;
    }
    if contains_any(line, CONFIRM_FAILURE_MARKERS) {
        return LineClass::ConfirmationFailed;
    }
    if let Some(slot) = RxSlot::from_header(line) {
        return LineClass::DownlinkHeader(slot);
    }
    match dialect.translate(line) {
        Some(result) => LineClass::Status(result),
        None => LineClass::Unmatched,
    }
}
