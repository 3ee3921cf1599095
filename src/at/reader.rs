//! Background line processor.
//!
//! Owns the read half of the transport for the lifetime of a session. Every
//! line is classified; events go to the [`EventSink`], status and unmatched
//! lines go to the [`Correlator`]. Nothing that happens on this path is
//! allowed to escape as an error except loss of the transport itself.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::classifier::{classify, LineClass};
use super::codes::TerminalDialect;
use super::correlator::{Completion, Correlator};
use super::frame::{self, FrameError, RxSlot};
use super::types::{MetricsSnapshot, ModemEvent};
use crate::serial::{self, LineReader, ReadOutcome};

/// Receives events decoded by the line processor. Called on the processor
/// task, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: ModemEvent);
}

/// What happened to one received line
#[derive(Debug, Clone, PartialEq)]
pub enum LineDisposition {
    Event(ModemEvent),
    Command(Completion),
    /// Negative send confirmation, logged and otherwise ignored
    ConfirmationFailed,
    FrameError(FrameError),
}

pub struct LineProcessor {
    label: String,
    dialect: TerminalDialect,
    frame_line_timeout: Duration,
    correlator: Arc<Correlator>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<watch::Sender<MetricsSnapshot>>,
}

impl LineProcessor {
    pub fn new(
        label: impl Into<String>,
        dialect: TerminalDialect,
        frame_line_timeout: Duration,
        correlator: Arc<Correlator>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<watch::Sender<MetricsSnapshot>>,
    ) -> Self {
        Self {
            label: label.into(),
            dialect,
            frame_line_timeout,
            correlator,
            sink,
            metrics,
        }
    }

    /// Classify `line` and act on it. Downlink headers pull their two
    /// follow-up lines from `reader` before returning.
    pub async fn process_line(&self, line: &str, reader: &mut dyn LineReader) -> serial::Result<LineDisposition> {
        self.metrics.send_modify(|m| m.lines_read += 1);
        log::debug!("[{}] <- {}", self.label, line);

        let disposition = match classify(line, self.dialect) {
            LineClass::JoinCompleted(joined) => self.emit(ModemEvent::JoinCompleted { joined }),
            LineClass::MessageConfirmed => self.emit(ModemEvent::MessageConfirmed),
            LineClass::ConfirmationFailed => {
                log::warn!("[{}] Confirmed uplink was not acknowledged: {}", self.label, line);
                LineDisposition::ConfirmationFailed
            }
            LineClass::DownlinkHeader(slot) => self.assemble_downlink(slot, line, reader).await?,
            LineClass::Status(result) => LineDisposition::Command(self.correlator.complete(result)),
            LineClass::Unmatched => LineDisposition::Command(self.correlator.accept_unmatched(line)),
        };

        if disposition == LineDisposition::Command(Completion::Unsolicited) {
            log::debug!("[{}] Discarding unsolicited line {:?}", self.label, line);
            self.metrics.send_modify(|m| m.unsolicited_lines += 1);
        }
        Ok(disposition)
    }

    async fn assemble_downlink(&self, slot: RxSlot, header: &str, reader: &mut dyn LineReader) -> serial::Result<LineDisposition> {
        let mut follow_up = Vec::with_capacity(2);
        while follow_up.len() < 2 {
            match reader.read_line(self.frame_line_timeout).await? {
                ReadOutcome::Line(line) => follow_up.push(line),
                ReadOutcome::TimedOut | ReadOutcome::Closed => {
                    return Ok(self.frame_error(FrameError::Truncated { received: follow_up.len() + 1 }));
                }
            }
        }
        log::debug!("[{}] Skipping downlink line {:?}", self.label, follow_up[0]);

        match frame::assemble(slot, header, &follow_up[1]) {
            Ok(downlink) => Ok(self.emit(ModemEvent::MessageReceived(downlink))),
            Err(e) => Ok(self.frame_error(e)),
        }
    }

    fn emit(&self, event: ModemEvent) -> LineDisposition {
        self.metrics.send_modify(|m| m.events_dispatched += 1);
        self.sink.dispatch(event.clone());
        LineDisposition::Event(event)
    }

    fn frame_error(&self, error: FrameError) -> LineDisposition {
        log::warn!("[{}] Dropping malformed downlink: {}", self.label, error);
        let message = error.to_string();
        self.metrics.send_modify(|m| {
            m.frame_errors += 1;
            m.last_error = Some(message.clone());
        });
        self.sink.dispatch(ModemEvent::ProtocolNotice { message });
        LineDisposition::FrameError(error)
    }

    fn transport_failed(&self, reason: &str) {
        log::error!("[{}] Serial transport lost: {}", self.label, reason);
        self.correlator.fail(reason);
        self.sink.dispatch(ModemEvent::ProtocolNotice { message: format!("Transport lost: {}", reason) });
    }
}

async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    // a dropped sender counts as stop
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Read lines until `stop_rx` flips to true or the transport fails.
pub async fn reader_task(
    processor: LineProcessor,
    mut reader: Box<dyn LineReader>,
    mut stop_rx: watch::Receiver<bool>,
    idle_read_timeout: Duration,
) {
    log::debug!("[{}] Line processor started", processor.label);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let outcome = tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            outcome = reader.read_line(idle_read_timeout) => outcome,
        };

        match outcome {
            Ok(ReadOutcome::Line(line)) => {
                // a downlink frame reads more lines; stop must not wait for them
                let processed = tokio::select! {
                    biased;
                    _ = wait_for_stop(&mut stop_rx) => break,
                    processed = processor.process_line(&line, reader.as_mut()) => processed,
                };
                if let Err(e) = processed {
                    processor.transport_failed(&e.to_string());
                    break;
                }
            }
            // idle: nothing on the wire
            Ok(ReadOutcome::TimedOut) => {}
            Ok(ReadOutcome::Closed) => {
                processor.transport_failed("serial stream closed");
                break;
            }
            Err(e) => {
                processor.transport_failed(&e.to_string());
                break;
            }
        }
    }

    log::debug!("[{}] Line processor stopped", processor.label);
}
