use super::demux::MissingResult;
use super::types::ClassificationResult;
use crate::error::StreamError;
use crate::session::CloseReport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Everything a session reports to its consumer, in emission order
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Handshake succeeded; frames are now accepted
    Active { session_id: String },
    /// A matched classification result, in arrival order
    Result(ClassificationResult),
    /// Advisory: a sent frame has not been answered in time
    MissingResult(MissingResult),
    /// Terminal success
    Closed(CloseReport),
    /// Terminal error with its triggering cause
    Failed {
        session_id: String,
        cause: StreamError,
    },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Failed { .. })
    }
}

/// Sending half of a session's event queue
///
/// One slot is reserved when the queue is created and spent on the terminal
/// event, so `Closed` or `Failed` always reaches the consumer even when it has
/// stopped reading.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
    terminal: Arc<Mutex<Option<mpsc::OwnedPermit<SessionEvent>>>>,
    undelivered: Arc<AtomicU64>,
}

impl EventSink {
    /// Create an event queue holding `capacity` events plus the terminal one.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        let terminal = tx.clone().try_reserve_owned().ok();
        let sink = Self {
            tx,
            terminal: Arc::new(Mutex::new(terminal)),
            undelivered: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Deliver a result-stream event, waiting for queue space.
    ///
    /// A slow consumer slows the inbound listener, never the frame path.
    pub async fn deliver(&self, event: SessionEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Event consumer dropped; discarding event");
        }
    }

    /// Count an event that was given up on before the consumer made room.
    pub fn record_undelivered(&self) {
        self.undelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    /// Emit a non-terminal lifecycle event without waiting.
    pub fn notify(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Event queue full; lifecycle event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event consumer dropped; discarding lifecycle event");
            }
        }
    }

    /// Emit the terminal event into the reserved slot.
    ///
    /// Only the first call uses the reservation; the session is over after it.
    pub fn finish(&self, event: SessionEvent) {
        let permit = self
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match permit {
            Some(permit) => drop(permit.send(event)),
            None => {
                warn!(?event, "Terminal event already emitted");
            }
        }
    }
}
