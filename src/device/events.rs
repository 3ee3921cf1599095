//! Event delivery for a modem session: the registered handler, the broadcast
//! fan-out and the join-driven state transitions.
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, watch};

use super::models::DeviceState;
use crate::at::{Downlink, EventSink, ModemEvent};

/// Callbacks for asynchronous modem events. Every method defaults to a no-op.
///
/// Handlers run on the session's line processor task; long work should be
/// handed off rather than done inline.
pub trait ModemEventHandler: Send + Sync {
    fn on_join_completed(&self, _joined: bool) {}

    fn on_message_confirmed(&self) {}

    fn on_message_received(&self, _downlink: &Downlink) {}
}

pub(crate) struct SessionEvents {
    label: String,
    handler: RwLock<Option<Arc<dyn ModemEventHandler>>>,
    events_tx: broadcast::Sender<ModemEvent>,
    state_tx: watch::Sender<DeviceState>,
}

impl SessionEvents {
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity);
        let (state_tx, _) = watch::channel(DeviceState::Uninitialised);
        Self {
            label: label.into(),
            handler: RwLock::new(None),
            events_tx,
            state_tx,
        }
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn ModemEventHandler>>) {
        *self.handler.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = handler;
    }

    fn handler(&self) -> Option<Arc<dyn ModemEventHandler>> {
        self.handler.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModemEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    /// Move to `next` unless the session is already disposed
    pub fn set_state(&self, next: DeviceState) {
        self.transition(|_| Some(next));
    }

    /// Apply `f` to the current state; `None` keeps it. Disposed is final.
    pub fn transition(&self, f: impl FnOnce(DeviceState) -> Option<DeviceState>) {
        let label = &self.label;
        self.state_tx.send_if_modified(|state| {
            if *state == DeviceState::Disposed {
                return false;
            }
            match f(*state) {
                Some(next) if next != *state => {
                    log::debug!("[{}] State {:?} -> {:?}", label, *state, next);
                    *state = next;
                    true
                }
                _ => false,
            }
        });
    }
}

impl EventSink for SessionEvents {
    fn dispatch(&self, event: ModemEvent) {
        match &event {
            ModemEvent::JoinCompleted { joined } => {
                let next = if *joined { DeviceState::Joined } else { DeviceState::JoinFailed };
                log::info!("[{}] Join {}", self.label, if *joined { "completed" } else { "failed" });
                self.set_state(next);
                if let Some(handler) = self.handler() {
                    handler.on_join_completed(*joined);
                }
            }
            ModemEvent::MessageConfirmed => {
                log::debug!("[{}] Uplink confirmed", self.label);
                if let Some(handler) = self.handler() {
                    handler.on_message_confirmed();
                }
            }
            ModemEvent::MessageReceived(downlink) => {
                log::info!(
                    "[{}] Downlink on port {} ({} bytes, RSSI {}, SNR {})",
                    self.label,
                    downlink.port,
                    downlink.payload.len() / 2,
                    downlink.rssi,
                    downlink.snr
                );
                if let Some(handler) = self.handler() {
                    handler.on_message_received(downlink);
                }
            }
            ModemEvent::ProtocolNotice { .. } => {}
        }
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }
}
