use crate::error::{StreamError, TransportError};
use crate::results::{EventSink, ResultDemultiplexer, ResultOutcome, SessionEvent};
use crate::transport::{ResultMessage, ResultStream};
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

enum Wake {
    Shutdown,
    Inbound(Option<Result<ResultMessage, TransportError>>),
    Sweep,
}

/// Reads a session's result stream, classifies each result, and reports gaps.
pub(super) struct ResultListener {
    pub session_id: String,
    pub inbound: ResultStream,
    pub demux: Arc<ResultDemultiplexer>,
    pub events: EventSink,
    pub faults: mpsc::Sender<StreamError>,
    pub shutdown: watch::Receiver<bool>,
    /// Set when a pending delivery must be given up
    pub cutoff: watch::Receiver<bool>,
    pub sweep_every: Duration,
}

impl ResultListener {
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.changed() => Wake::Shutdown,
                message = self.inbound.next() => Wake::Inbound(message),
                _ = sweep.tick() => Wake::Sweep,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Inbound(Some(Ok(message))) => {
                    let result = message.into_result();
                    if self.demux.on_result(&result, Instant::now()) == ResultOutcome::Delivered {
                        self.emit(SessionEvent::Result(result)).await;
                    }
                }
                Wake::Inbound(Some(Err(e))) => {
                    warn!(session_id = %self.session_id, "Dropping undecodable result: {}", e);
                }
                Wake::Inbound(None) => {
                    if !*self.shutdown.borrow() {
                        warn!(session_id = %self.session_id, "Result stream ended");
                        let cause = StreamError::BackendDisconnected(self.session_id.clone());
                        if self.faults.send(cause).await.is_err() {
                            debug!(session_id = %self.session_id, "Fault receiver gone");
                        }
                    }
                    break;
                }
                Wake::Sweep => {
                    for missing in self.demux.sweep(Instant::now()) {
                        warn!(
                            session_id = %self.session_id,
                            sequence = missing.sequence,
                            overtaken = missing.overtaken,
                            "Result missing"
                        );
                        self.emit(SessionEvent::MissingResult(missing)).await;
                    }
                }
            }
        }

        debug!(session_id = %self.session_id, "Result listener stopped");
    }

    /// Wait for the consumer to take `event`, unless delivery is cut off.
    async fn emit(&mut self, event: SessionEvent) {
        let events = &self.events;
        let cutoff = &mut self.cutoff;
        let delivered = tokio::select! {
            biased;
            _ = events.deliver(event) => true,
            _ = cutoff.wait_for(|cut| *cut) => false,
        };
        if !delivered {
            events.record_undelivered();
        }
    }
}
