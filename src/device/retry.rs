//! Host-side join retry on top of [`LoraWanModem::join`].
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::manager::LoraWanModem;
use super::models::{DeviceState, JoinParams};
use super::{DeviceError, Result};
use crate::at::{AtError, CommandResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRetryPolicy {
    pub attempts: u32,
    /// Pause between a failed attempt and the next one
    pub interval_ms: u64,
    /// How long to wait for the join event after the modem accepted the request
    pub join_timeout_ms: u64,
}

impl Default for JoinRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval_ms: 10_000,
            join_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { attempts: u32 },
    /// `last_result` is the status of the final join command; `last_state` is
    /// what the session looked like when the attempt gave up.
    Exhausted {
        attempts: u32,
        last_result: CommandResult,
        last_state: DeviceState,
    },
}

impl JoinOutcome {
    pub fn is_joined(&self) -> bool {
        matches!(self, JoinOutcome::Joined { .. })
    }
}

/// Issue `AT+JOIN` until a join event reports success or the attempts run out
pub async fn join_with_retry(
    modem: &LoraWanModem,
    params: &JoinParams,
    policy: &JoinRetryPolicy,
) -> Result<JoinOutcome> {
    if policy.attempts == 0 {
        return Err(DeviceError::InvalidArgument("join retry needs at least one attempt".to_string()));
    }
    params.validate()?;

    let mut state_rx = modem.state_receiver();
    let join_timeout = Duration::from_millis(policy.join_timeout_ms);
    let mut last_result = CommandResult::Timeout;
    let mut last_state = modem.state();

    for attempt in 1..=policy.attempts {
        if attempt > 1 {
            tokio::time::sleep(Duration::from_millis(policy.interval_ms)).await;
        }
        log::info!("[{}] Join attempt {}/{}", modem.id(), attempt, policy.attempts);

        last_result = modem.join(params).await?;
        if last_result == CommandResult::Disposed {
            last_state = DeviceState::Disposed;
            break;
        }
        if !last_result.is_success() {
            log::warn!("[{}] Join request rejected: {}", modem.id(), last_result);
            last_state = modem.state();
            continue;
        }

        let settled = state_rx.wait_for(|state| {
            matches!(state, DeviceState::Joined | DeviceState::JoinFailed | DeviceState::Disposed)
        });
        let observed = match tokio::time::timeout(join_timeout, settled).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => return Err(AtError::Disposed.into()),
            Err(_) => {
                log::warn!("[{}] No join event within {:?}", modem.id(), join_timeout);
                modem.state()
            }
        };

        match observed {
            DeviceState::Joined => return Ok(JoinOutcome::Joined { attempts: attempt }),
            DeviceState::Disposed => {
                last_state = observed;
                break;
            }
            other => last_state = other,
        }
    }

    Ok(JoinOutcome::Exhausted {
        attempts: policy.attempts,
        last_result,
        last_state,
    })
}
