//! Terminal status translation for the two firmware generations.
//!
//! Symbolic firmware ends each command with a standalone token (`OK`,
//! `AT_PARAM_ERROR`, ...). The numeric generation replies `OK` or
//! `ERROR:<code>`.
use serde::{Deserialize, Serialize};

use super::types::CommandResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalDialect {
    #[default]
    Symbolic,
    Numeric,
}

impl TerminalDialect {
    /// Map a line to its terminal result, or `None` if the line is not a
    /// status token in this dialect
    pub fn translate(self, line: &str) -> Option<CommandResult> {
        match self {
            TerminalDialect::Symbolic => symbolic_status(line),
            TerminalDialect::Numeric => numeric_status(line),
        }
    }
}

pub fn symbolic_status(line: &str) -> Option<CommandResult> {
    let result = match line.trim() {
        "OK" => CommandResult::Success,
        "AT_ERROR" => CommandResult::Error,
        "AT_PARAM_ERROR" => CommandResult::ParameterError,
        "AT_BUSY_ERROR" => CommandResult::BusyError,
        "AT_TEST_PARAM_OVERFLOW" => CommandResult::ParameterOverflow,
        "AT_NO_NETWORK_JOINED" => CommandResult::NotJoined,
        "AT_RX_ERROR" => CommandResult::ReceiveError,
        // Firmware spelling
        "AT_DUTYCYLE_RESTRICTED" => CommandResult::DutyCycleRestricted,
        _ => return None,
    };
    Some(result)
}

pub fn numeric_status(line: &str) -> Option<CommandResult> {
    let line = line.trim();
    if line == "OK" {
        return Some(CommandResult::Success);
    }
    line.strip_prefix("ERROR:").map(translate_error_code)
}

/// Translate the code after `ERROR:`; anything unknown is `ResponseInvalid`
pub fn translate_error_code(code: &str) -> CommandResult {
    let Ok(code) = code.trim().parse::<u16>() else {
        return CommandResult::ResponseInvalid;
    };
    match code {
        // unsupported command, flash access, service unknown/closed, no channel,
        // status error, tx timeout, join failed, duplicate downlink
        1 | 3 | 81 | 88 | 91 | 93 | 94 | 99 | 100 => CommandResult::Error,
        // bad parameter, frequency, data rate, region
        2 | 82 | 83 | 84 | 85 | 89 => CommandResult::ParameterError,
        5 | 80 | 92 => CommandResult::BusyError,
        86 => CommandResult::NotJoined,
        87 | 101 => CommandResult::ParameterOverflow,
        90 => CommandResult::DutyCycleRestricted,
        95..=98 => CommandResult::ReceiveError,
        _ => CommandResult::ResponseInvalid,
    }
}
