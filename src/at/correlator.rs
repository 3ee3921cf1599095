//! Single-flight command correlation.
//!
//! The caller writes a command and waits on a oneshot; the line processor
//! resolves it when the terminal line arrives. Every command carries a
//! generation number. A command that times out is parked for a grace window
//! so that its late terminal line is claimed by it and discarded, instead of
//! resolving whatever command was issued next.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use super::types::{AbandonedCommand, CommandResponse, CommandResult, CommandSpec, MetricsSnapshot, PendingCommand};
use super::{AtError, Result};
use crate::serial::{LineWriter, SerialError};

/// What the correlator did with a line handed to it by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The pending command was resolved
    Resolved { generation: u64 },
    /// Value line stored on the pending query
    Buffered { generation: u64 },
    /// Late line of a timed-out command, discarded
    LateReply { generation: u64 },
    /// Nothing was waiting for this line
    Unsolicited,
}

#[derive(Debug, Clone)]
enum CloseReason {
    Disposed,
    Lost(String),
}

#[derive(Default)]
struct CorrelationState {
    next_generation: u64,
    pending: Option<PendingCommand>,
    abandoned: VecDeque<AbandonedCommand>,
    closed: Option<CloseReason>,
}

impl CorrelationState {
    /// Oldest timed-out command still inside its grace window that owns this line
    fn claim_late_reply(&mut self, is_status: bool) -> Option<AbandonedCommand> {
        let now = Instant::now();
        self.abandoned.retain(|a| a.expires > now);
        let front = self.abandoned.front()?;
        if is_status || !front.collect_values {
            // the line may have been the reply of whoever is waiting now
            if let Some(pending) = self.pending.as_mut() {
                pending.reply_claimed = true;
            }
            self.abandoned.pop_front()
        } else {
            // value line of a late query; its status line settles it
            Some(front.clone())
        }
    }
}

pub struct Correlator {
    label: String,
    state: Mutex<CorrelationState>,
    writer: tokio::sync::Mutex<Option<Box<dyn LineWriter>>>,
    metrics: Arc<watch::Sender<MetricsSnapshot>>,
    late_reply_grace: Duration,
}

impl Correlator {
    pub fn new(
        label: impl Into<String>,
        writer: Box<dyn LineWriter>,
        metrics: Arc<watch::Sender<MetricsSnapshot>>,
        late_reply_grace: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(CorrelationState::default()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            metrics,
            late_reply_grace,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CorrelationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_pending(&self) -> bool {
        self.lock_state().pending.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed.is_some()
    }

    /// Write `command` and wait for its terminal line or `spec.timeout`.
    ///
    /// Fails fast with [`AtError::CommandInFlight`] if another command is
    /// still waiting. Device-side outcomes, including timeout, come back as
    /// `Ok` with the matching [`CommandResult`].
    pub async fn execute(&self, command: &str, spec: CommandSpec) -> Result<CommandResponse> {
        let command = command.trim();
        if command.is_empty() || command.contains(['\r', '\n']) {
            return Err(AtError::InvalidCommand(command.to_string()));
        }

        let (responder, mut rx) = oneshot::channel();
        let generation = {
            let mut state = self.lock_state();
            match &state.closed {
                Some(CloseReason::Disposed) => return Err(AtError::Disposed),
                Some(CloseReason::Lost(reason)) => return Err(SerialError::ConnectionLost(reason.clone()).into()),
                None => {}
            }
            if let Some(pending) = &state.pending {
                return Err(AtError::CommandInFlight(pending.command.clone()));
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.pending = Some(PendingCommand {
                generation,
                command: command.to_string(),
                spec: spec.clone(),
                started: Instant::now(),
                responder,
                buffer: Vec::new(),
                reply_claimed: false,
            });
            generation
        };
        let _cancel = CancelGuard { correlator: self, generation };

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.write_line(command).await,
                None => Err(SerialError::Closed),
            }
        };
        if let Err(e) = written {
            self.withdraw(generation);
            // dispose may have released us while we were writing
            if let Ok(Ok(response)) = rx.try_recv() {
                return Ok(response);
            }
            log::error!("[{}] Failed to write {:?}: {}", self.label, command, e);
            return Err(e.into());
        }
        log::debug!("[{}] -> {} (generation {})", self.label, command, generation);

        match tokio::time::timeout(spec.timeout, &mut rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(AtError::Disposed),
            Err(_) => self.expire(generation, &spec, rx),
        }
    }

    /// Keep a timed-out or cancelled command around so its late terminal line is
    /// discarded. Not done when its reply was already taken by an older command,
    /// otherwise one lost reply would make every following command time out.
    fn park(&self, state: &mut CorrelationState, pending: &PendingCommand) -> bool {
        if pending.reply_claimed || state.closed.is_some() {
            return false;
        }
        state.abandoned.push_back(AbandonedCommand {
            generation: pending.generation,
            command: pending.command.clone(),
            collect_values: pending.spec.collect_values,
            expires: Instant::now() + self.late_reply_grace,
        });
        true
    }

    /// The caller stopped waiting before the command settled
    fn abandon(&self, generation: u64) {
        let mut state = self.lock_state();
        let pending = match state.pending.take() {
            Some(pending) if pending.generation == generation => pending,
            other => {
                state.pending = other;
                return;
            }
        };
        let parked = self.park(&mut state, &pending);
        drop(state);
        log::warn!(
            "[{}] Command '{}' (generation {}) dropped by its caller{}",
            self.label,
            pending.command,
            generation,
            if parked { "; discarding its late reply" } else { "" }
        );
    }

    fn withdraw(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.pending.as_ref().map(|p| p.generation) == Some(generation) {
            state.pending = None;
        }
    }

    fn expire(
        &self,
        generation: u64,
        spec: &CommandSpec,
        mut rx: oneshot::Receiver<std::result::Result<CommandResponse, SerialError>>,
    ) -> Result<CommandResponse> {
        let mut state = self.lock_state();
        let pending = match state.pending.take() {
            Some(pending) if pending.generation == generation => pending,
            other => {
                // the processor resolved us right at the deadline
                state.pending = other;
                drop(state);
                return match rx.try_recv() {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(AtError::Disposed),
                };
            }
        };
        let parked = self.park(&mut state, &pending);
        drop(state);
        if !parked {
            log::debug!(
                "[{}] Not waiting for a late reply to '{}'; an older command consumed it",
                self.label, pending.command
            );
        }

        if pending.buffer.is_empty() {
            log::warn!("[{}] Command '{}' timeout after {:?}; no lines received", self.label, spec.name, spec.timeout);
        } else {
            log::warn!("[{}] Command '{}' timeout after {:?}; partial lines: {:?}", self.label, spec.name, spec.timeout, pending.buffer);
        }
        self.metrics.send_modify(|m| {
            m.command_timeouts += 1;
            m.last_error = Some(format!("{} timed out", pending.command));
        });

        Ok(CommandResponse { result: CommandResult::Timeout, lines: pending.buffer })
    }

    /// A status token arrived
    pub fn complete(&self, result: CommandResult) -> Completion {
        let state = self.lock_state();
        self.resolve(state, result, true)
    }

    /// A line that is neither an event nor a status token arrived
    pub fn accept_unmatched(&self, line: &str) -> Completion {
        let mut state = self.lock_state();
        if let Some(late) = state.claim_late_reply(false) {
            drop(state);
            return self.discard_late(late, line);
        }
        match state.pending.as_mut() {
            None => return Completion::Unsolicited,
            Some(pending) if pending.spec.collect_values => {
                pending.buffer.push(line.to_string());
                return Completion::Buffered { generation: pending.generation };
            }
            Some(_) => {}
        }
        self.resolve(state, CommandResult::Undefined(line.to_string()), false)
    }

    fn resolve(&self, mut state: MutexGuard<'_, CorrelationState>, result: CommandResult, is_status: bool) -> Completion {
        if let Some(late) = state.claim_late_reply(is_status) {
            drop(state);
            return self.discard_late(late, &result.to_string());
        }
        let Some(pending) = state.pending.take() else {
            return Completion::Unsolicited;
        };
        drop(state);

        let latency = pending.started.elapsed();
        self.metrics.send_modify(|m| m.record_completion(latency));
        log::debug!(
            "[{}] <- {} for '{}' (generation {}, {:?})",
            self.label, result, pending.command, pending.generation, latency
        );

        let generation = pending.generation;
        let _ = pending.responder.send(Ok(CommandResponse { result, lines: pending.buffer }));
        Completion::Resolved { generation }
    }

    fn discard_late(&self, late: AbandonedCommand, what: &str) -> Completion {
        log::warn!(
            "[{}] Discarding late reply '{}' for timed-out '{}' (generation {})",
            self.label, what, late.command, late.generation
        );
        self.metrics.send_modify(|m| m.late_replies_discarded += 1);
        Completion::LateReply { generation: late.generation }
    }

    /// Release the waiting caller with `Disposed` and refuse further commands.
    /// Returns whether a caller was waiting.
    pub fn close(&self) -> bool {
        let mut state = self.lock_state();
        if state.closed.is_none() {
            state.closed = Some(CloseReason::Disposed);
        }
        state.abandoned.clear();
        let Some(pending) = state.pending.take() else {
            return false;
        };
        drop(state);

        log::info!("[{}] Releasing '{}' (generation {}) on dispose", self.label, pending.command, pending.generation);
        let _ = pending.responder.send(Ok(CommandResponse { result: CommandResult::Disposed, lines: pending.buffer }));
        true
    }

    /// The transport failed underneath us
    pub fn fail(&self, reason: &str) {
        let mut state = self.lock_state();
        if state.closed.is_none() {
            state.closed = Some(CloseReason::Lost(reason.to_string()));
        }
        let pending = state.pending.take();
        drop(state);

        self.metrics.send_modify(|m| m.last_error = Some(reason.to_string()));
        if let Some(pending) = pending {
            let _ = pending.responder.send(Err(SerialError::ConnectionLost(reason.to_string())));
        }
    }

    /// Shut down and drop the write half of the transport
    pub async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                log::debug!("[{}] Error closing transport: {}", self.label, e);
            }
        }
    }
}

/// Releases the pending slot if the `execute` future is dropped mid-flight
struct CancelGuard<'a> {
    correlator: &'a Correlator,
    generation: u64,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.correlator.abandon(self.generation);
    }
}
