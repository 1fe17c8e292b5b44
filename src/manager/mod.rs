//! Session lifecycle orchestration
//!
//! `SessionManager` owns every live session and drives it through
//! `Created -> Authenticating -> Active -> Draining -> Closed`, or into
//! `Failed` from any non-terminal state. Each session gets its own frame
//! stage, transmission pipeline, result listener and event queue; nothing
//! mutable is shared between sessions.

mod listener;
mod retired;

use crate::capture::{BackpressurePolicy, CaptureSource, CaptureSummary};
use crate::config::StreamSettings;
use crate::error::{Result, StreamError, TransportError};
use crate::frame::{FrameBuffer, FrameSequencer};
use crate::pipeline::{EnqueueOutcome, TransmissionPipeline, WorkerConfig};
use crate::results::{EventSink, ResultDemultiplexer, SessionEvent};
use crate::session::{CloseReport, Session, SessionConfig, SessionState, SessionStats};
use crate::transport::{HandshakeRequest, SessionChannel, Transport};
use chrono::Utc;
use listener::ResultListener;
use retired::RetiredSessions;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A started session: its authoritative id and its event stream.
///
/// Events arrive in emission order: `Active`, then results and missing-result
/// notices, then exactly one of `Closed` or `Failed`.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    pub events: mpsc::Receiver<SessionEvent>,
}

struct FrameStage {
    buffer: FrameBuffer,
    sequencer: FrameSequencer,
}

struct SessionEntry {
    session: Mutex<Session>,
    frames: Mutex<FrameStage>,
    pipeline: TransmissionPipeline,
    demux: Arc<ResultDemultiplexer>,
    events: EventSink,
    /// Stops the listener and supervisor tasks
    shutdown: watch::Sender<bool>,
    /// Makes the listener give up on a consumer that stopped reading
    cutoff: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEntry {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn frames(&self) -> MutexGuard<'_, FrameStage> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> SessionStats {
        let mut stats = base_stats(&self.session());
        {
            let frames = self.frames();
            stats.frames_accepted = frames.sequencer.accepted();
            stats.frames_late = frames.sequencer.late_frames();
        }

        let counters = self.pipeline.counters();
        stats.frames_sent = counters.sent.load(Ordering::Relaxed);
        stats.backpressure_events = counters.backpressure.load(Ordering::Relaxed);
        stats.frames_dropped_oldest = counters.dropped_oldest.load(Ordering::Relaxed);
        stats.retries = counters.retries.load(Ordering::Relaxed);
        stats.queue_depth = self.pipeline.depth();

        let results = self.demux.counters();
        stats.results_delivered = results.delivered;
        stats.results_unmatched = results.unmatched;
        stats.results_duplicate = results.duplicate;
        stats.results_missing = results.missing;
        stats.outstanding = self.demux.outstanding();
        stats.events_undelivered = self.events.undelivered();
        stats
    }

    /// Signal the listener to stop and wait for it.
    ///
    /// A listener still waiting on the consumer after `grace` is cut off; its
    /// pending events are counted as undelivered.
    async fn stop_listener(&self, grace: Duration) {
        self.shutdown.send_replace(true);
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_ok() {
            return;
        }

        warn!("Event consumer is not keeping up; cutting off pending results");
        self.cutoff.send_replace(true);
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("Result listener did not stop in time; aborting");
            handle.abort();
        }
    }
}

fn base_stats(session: &Session) -> SessionStats {
    let uptime = Utc::now() - session.created_at();
    SessionStats {
        session_id: session.id().to_string(),
        state: session.state(),
        created_at: session.created_at(),
        authenticated_at: session.authenticated_at(),
        uptime_secs: uptime.num_milliseconds() as f64 / 1000.0,
        frames_accepted: 0,
        frames_late: 0,
        frames_sent: 0,
        queue_depth: 0,
        backpressure_events: 0,
        frames_dropped_oldest: 0,
        retries: 0,
        results_delivered: 0,
        results_unmatched: 0,
        results_duplicate: 0,
        results_missing: 0,
        outstanding: 0,
        events_undelivered: 0,
        failure: session.failure().map(|e| e.to_string()),
    }
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    settings: StreamSettings,
    live: RwLock<HashMap<String, Arc<SessionEntry>>>,
    /// Terminal sessions; their ids are never reused
    retired: Mutex<RetiredSessions>,
}

/// Creates, drives and tears down streaming sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, settings: StreamSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                live: RwLock::new(HashMap::new()),
                retired: Mutex::new(RetiredSessions::new(settings.retired_history.max(1))),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.inner.settings
    }

    /// Validate `config`, authenticate with the backend, and open the session.
    ///
    /// An invalid config is rejected before any session exists. Handshake
    /// failures leave a `Failed` session behind under its provisional id.
    pub async fn start_session(&self, config: SessionConfig) -> Result<SessionHandle> {
        config.validate()?;

        let mut session = Session::new(config);
        session.transition(SessionState::Authenticating)?;
        let span = info_span!("session", provisional = %session.id());
        self.inner.establish(session).instrument(span).await
    }

    /// Capture, sequence and enqueue one PCM buffer, stamped with the current time.
    ///
    /// Never blocks. A full queue returns `EnqueueOutcome::Backpressure` and
    /// leaves the sequence counter untouched.
    pub fn push(&self, session_id: &str, raw: &[u8]) -> Result<EnqueueOutcome> {
        self.inner.enqueue(session_id, raw, None)
    }

    /// Like `push`, with a capture timestamp supplied by the source.
    pub fn push_at(
        &self,
        session_id: &str,
        raw: &[u8],
        capture_timestamp_ms: u64,
    ) -> Result<EnqueueOutcome> {
        self.inner.enqueue(session_id, raw, Some(capture_timestamp_ms))
    }

    /// Drop the oldest unsent frame of a session. Returns whether one was dropped.
    pub fn drop_oldest(&self, session_id: &str) -> Result<bool> {
        let entry = self.inner.lookup(session_id)?;
        Ok(entry.pipeline.drop_oldest().is_some())
    }

    /// Drain and close a session.
    ///
    /// Queued frames are flushed within the flush grace period, outstanding
    /// results are awaited within the result grace period, and anything left
    /// is discarded and counted in the report.
    pub async fn close_session(&self, session_id: &str) -> Result<CloseReport> {
        let entry = self.inner.lookup(session_id)?;
        let span = info_span!("session", id = %session_id);
        self.inner.close(session_id, entry).instrument(span).await
    }

    /// Pull frames from `source` into a session until it ends or the session stops.
    ///
    /// A source that fails before yielding any frame fails the session with
    /// `CaptureUnavailable`. A later read error ends capture but leaves the
    /// session running.
    pub async fn run_capture(
        &self,
        session_id: &str,
        source: &mut dyn CaptureSource,
        policy: BackpressurePolicy,
    ) -> Result<CaptureSummary> {
        let entry = self.inner.lookup(session_id)?;
        let retry_delay = {
            let session = entry.session();
            session.config().hop_duration().max(Duration::from_millis(1))
        };

        info!(%session_id, source = source.name(), ?policy, "Capture started");
        let mut summary = CaptureSummary::default();

        loop {
            let raw = match source.read_frame().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) if summary.frames_read == 0 => {
                    let cause = StreamError::CaptureUnavailable(e.to_string());
                    self.inner.fail_session(session_id, cause.clone()).await;
                    return Err(cause);
                }
                Err(e) => {
                    warn!(%session_id, "Capture read failed, stopping capture: {}", e);
                    summary.capture_error = Some(e.to_string());
                    break;
                }
            };
            summary.frames_read += 1;

            loop {
                match self.push(session_id, &raw) {
                    Ok(EnqueueOutcome::Accepted { .. }) => {
                        summary.frames_accepted += 1;
                        break;
                    }
                    Ok(EnqueueOutcome::Backpressure) => match policy {
                        BackpressurePolicy::DropNewest => {
                            summary.frames_dropped += 1;
                            break;
                        }
                        BackpressurePolicy::DropOldest => {
                            if entry.pipeline.drop_oldest().is_some() {
                                summary.frames_dropped += 1;
                            } else {
                                tokio::time::sleep(retry_delay).await;
                            }
                        }
                        BackpressurePolicy::Wait => tokio::time::sleep(retry_delay).await,
                    },
                    Ok(EnqueueOutcome::Closed) => {
                        info!(%session_id, "Transmission queue closed; capture stopped");
                        return Ok(summary);
                    }
                    Err(StreamError::FrameSizeMismatch { expected, actual }) => {
                        warn!(%session_id, expected, actual, "Skipping malformed capture buffer");
                        summary.frames_rejected += 1;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            %session_id,
            read = summary.frames_read,
            accepted = summary.frames_accepted,
            dropped = summary.frames_dropped,
            "Capture finished"
        );
        Ok(summary)
    }

    /// Current lifecycle state of a live or retired session
    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        if let Some(entry) = self.inner.live().get(session_id) {
            return Some(entry.session().state());
        }
        self.inner.retired().state(session_id)
    }

    /// Live stats, or the final stats of a recently retired session.
    ///
    /// A retired session whose stats have aged out of the history reports
    /// `SessionClosed`.
    pub fn stats(&self, session_id: &str) -> Result<SessionStats> {
        if let Some(entry) = self.inner.live().get(session_id).cloned() {
            return Ok(entry.stats());
        }
        let retired = self.inner.retired();
        if let Some(stats) = retired.stats(session_id) {
            return Ok(stats.clone());
        }
        match retired.state(session_id) {
            Some(state) => Err(StreamError::SessionClosed {
                session_id: session_id.to_string(),
                state,
            }),
            None => Err(StreamError::UnknownSession(session_id.to_string())),
        }
    }

    /// Ids of sessions that have not reached a terminal state
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.live().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every live session.
    pub async fn shutdown(&self) {
        for session_id in self.session_ids() {
            match self.close_session(&session_id).await {
                Ok(report) => info!(
                    %session_id,
                    sent = report.frames_sent,
                    discarded = report.frames_discarded,
                    "Session closed on shutdown"
                ),
                Err(e) => warn!(%session_id, "Session did not close cleanly: {}", e),
            }
        }
    }
}

impl ManagerInner {
    fn live(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SessionEntry>>> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<SessionEntry>>> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn retired(&self) -> MutexGuard<'_, RetiredSessions> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<SessionEntry>> {
        if let Some(entry) = self.live().get(session_id) {
            return Ok(Arc::clone(entry));
        }
        match self.retired().state(session_id) {
            Some(state) => Err(StreamError::SessionClosed {
                session_id: session_id.to_string(),
                state,
            }),
            None => Err(StreamError::UnknownSession(session_id.to_string())),
        }
    }

    async fn establish(self: &Arc<Self>, mut session: Session) -> Result<SessionHandle> {
        let provisional = session.id().to_string();
        let timeout = self.settings.handshake_timeout;
        info!(transport = self.transport.name(), "Authenticating session");

        let request = HandshakeRequest::new(&provisional, session.config());
        let assigned = match tokio::time::timeout(timeout, self.transport.handshake(&request)).await
        {
            Ok(Ok(assigned)) => assigned,
            Ok(Err(TransportError::Rejected(reason))) => {
                let cause = StreamError::AuthRejected {
                    session_id: provisional,
                    reason,
                };
                return Err(self.abort(session, cause));
            }
            Ok(Err(e)) => return Err(self.abort(session, StreamError::Transport(e))),
            Err(_) => {
                let cause = StreamError::HandshakeTimeout {
                    session_id: provisional,
                    timeout_ms: timeout.as_millis() as u64,
                };
                return Err(self.abort(session, cause));
            }
        };

        if self.is_known(&assigned) {
            return Err(self.abort(session, StreamError::SessionIdReused(assigned)));
        }

        let channel = match self.transport.open(&assigned).await {
            Ok(channel) => channel,
            Err(e) => return Err(self.abort(session, StreamError::Transport(e))),
        };
        session.authenticate(assigned)?;

        let (entry, handle, faults) = self.activate(session, channel);
        let session_id = handle.session_id.clone();

        let collided = {
            let mut live = self.live_mut();
            if live.contains_key(&session_id) || self.retired().contains(&session_id) {
                true
            } else {
                live.insert(session_id.clone(), Arc::clone(&entry));
                false
            }
        };
        if collided {
            let cause = StreamError::SessionIdReused(session_id.clone());
            entry.session().fail(cause.clone());
            entry.pipeline.close(Duration::ZERO).await;
            entry.stop_listener(self.settings.result_grace).await;
            return Err(cause);
        }

        tokio::spawn(
            supervise(
                Arc::downgrade(self),
                session_id.clone(),
                faults,
                entry.shutdown.subscribe(),
            )
            .in_current_span(),
        );

        info!(%session_id, "Session active");
        Ok(handle)
    }

    /// Build the per-session machinery for an authenticated session.
    fn activate(
        &self,
        session: Session,
        channel: SessionChannel,
    ) -> (Arc<SessionEntry>, SessionHandle, mpsc::Receiver<StreamError>) {
        let session_id = session.id().to_string();
        let config = session.config().clone();

        let demux = Arc::new(ResultDemultiplexer::new(
            &session_id,
            self.settings.result_window,
            self.settings.gap_timeout,
        ));
        let (fault_tx, fault_rx) = mpsc::channel(4);
        let pipeline = TransmissionPipeline::spawn(
            &session_id,
            channel.outbound,
            WorkerConfig {
                capacity: self.settings.capacity_for(&config),
                retry: self.settings.retry.clone(),
                send_timeout: self.settings.send_timeout,
            },
            Arc::clone(&demux),
            fault_tx.clone(),
        );

        let (events, events_rx) = EventSink::channel(self.settings.event_capacity);
        let (shutdown, _) = watch::channel(false);
        let (cutoff, _) = watch::channel(false);

        let listener = ResultListener {
            session_id: session_id.clone(),
            inbound: channel.inbound,
            demux: Arc::clone(&demux),
            events: events.clone(),
            faults: fault_tx,
            shutdown: shutdown.subscribe(),
            cutoff: cutoff.subscribe(),
            sweep_every: (self.settings.gap_timeout / 4).max(Duration::from_millis(10)),
        };
        let listener = tokio::spawn(listener.run().in_current_span());

        let mut buffer = FrameBuffer::new();
        buffer.bind(&session_id, &config);
        let sequencer = FrameSequencer::new(config.hop_duration(), self.settings.late_tolerance);

        events.notify(SessionEvent::Active {
            session_id: session_id.clone(),
        });

        let entry = Arc::new(SessionEntry {
            session: Mutex::new(session),
            frames: Mutex::new(FrameStage { buffer, sequencer }),
            pipeline,
            demux,
            events,
            shutdown,
            cutoff,
            listener: Mutex::new(Some(listener)),
        });
        let handle = SessionHandle {
            session_id,
            events: events_rx,
        };
        (entry, handle, fault_rx)
    }

    fn is_known(&self, session_id: &str) -> bool {
        self.live().contains_key(session_id) || self.retired().contains(session_id)
    }

    /// Fail a session that never became active and keep it as retired.
    fn abort(&self, mut session: Session, cause: StreamError) -> StreamError {
        warn!("Session failed during handshake: {}", cause);
        session.fail(cause.clone());
        self.retired().insert(base_stats(&session));
        cause
    }

    fn retire(&self, session_id: &str, entry: &SessionEntry) {
        let stats = entry.stats();
        self.live_mut().remove(session_id);
        self.retired().insert(stats);
    }

    fn enqueue(
        &self,
        session_id: &str,
        raw: &[u8],
        capture_timestamp_ms: Option<u64>,
    ) -> Result<EnqueueOutcome> {
        let entry = self.lookup(session_id)?;
        let state = entry.session().state();
        if !state.accepts_frames() {
            return Err(StreamError::SessionClosed {
                session_id: session_id.to_string(),
                state,
            });
        }

        let mut frames = entry.frames();
        let FrameStage { buffer, sequencer } = &mut *frames;
        let captured = match capture_timestamp_ms {
            Some(ts) => buffer.capture_at(raw, ts)?,
            None => buffer.capture(raw)?,
        };
        Ok(entry.pipeline.enqueue_with(|| sequencer.next(captured)))
    }

    async fn close(&self, session_id: &str, entry: Arc<SessionEntry>) -> Result<CloseReport> {
        {
            let mut session = entry.session();
            let state = session.state();
            if state != SessionState::Active {
                return Err(StreamError::SessionClosed {
                    session_id: session_id.to_string(),
                    state,
                });
            }
            session.transition(SessionState::Draining)?;
        }
        entry.frames().buffer.unbind();
        info!("Draining session");

        let started = Instant::now();
        let sent_before = entry.pipeline.counters().sent.load(Ordering::SeqCst);
        let drain = entry.pipeline.close(self.settings.flush_grace).await;
        if let Some(cause) = drain.failure.clone() {
            entry.session().fail(cause);
        }

        let flushed = entry.session().state() == SessionState::Draining;
        if flushed && !entry.demux.wait_settled(self.settings.result_grace).await {
            warn!(
                outstanding = entry.demux.outstanding(),
                "Result grace period expired"
            );
        }
        entry.stop_listener(self.settings.result_grace).await;
        let abandoned = entry.demux.abandon();

        let (state, failure) = {
            let mut session = entry.session();
            if session.state() == SessionState::Draining {
                session.transition(SessionState::Closed)?;
            }
            (session.state(), session.failure().cloned())
        };

        let report = CloseReport {
            session_id: session_id.to_string(),
            state,
            frames_sent: drain.sent,
            frames_flushed: drain.sent.saturating_sub(sent_before),
            frames_discarded: drain.discarded,
            results_abandoned: abandoned,
            results_delivered: entry.demux.counters().delivered,
            events_undelivered: entry.events.undelivered(),
            drain_secs: started.elapsed().as_secs_f64(),
        };
        self.retire(session_id, &entry);

        match failure {
            Some(cause) if state == SessionState::Failed => {
                error!("Session failed while draining: {}", cause);
                entry.events.finish(SessionEvent::Failed {
                    session_id: session_id.to_string(),
                    cause: cause.clone(),
                });
                Err(cause)
            }
            _ => {
                info!(
                    sent = report.frames_sent,
                    discarded = report.frames_discarded,
                    abandoned = report.results_abandoned,
                    "Session closed"
                );
                entry.events.finish(SessionEvent::Closed(report.clone()));
                Ok(report)
            }
        }
    }

    /// Drive a live session to `Failed` and tear it down.
    ///
    /// A session already draining is only marked; `close` finishes it.
    async fn fail_session(&self, session_id: &str, cause: StreamError) {
        let entry = match self.lookup(session_id) {
            Ok(entry) => entry,
            Err(_) => return,
        };

        let previous = {
            let mut session = entry.session();
            let previous = session.state();
            if previous == SessionState::Draining
                && matches!(cause, StreamError::BackendDisconnected(_))
            {
                debug!(%session_id, "Result stream ended while draining");
                return;
            }
            if !session.fail(cause.clone()) {
                return;
            }
            previous
        };
        entry.frames().buffer.unbind();
        error!(%session_id, from = %previous, "Session failed: {}", cause);

        if previous == SessionState::Draining {
            return;
        }

        let drain = entry.pipeline.close(Duration::ZERO).await;
        entry.stop_listener(self.settings.result_grace).await;
        let abandoned = entry.demux.abandon();
        debug!(
            %session_id,
            discarded = drain.discarded,
            abandoned,
            "Failed session torn down"
        );

        self.retire(session_id, &entry);
        entry.events.finish(SessionEvent::Failed {
            session_id: session_id.to_string(),
            cause,
        });
    }
}

/// Waits for the first fatal fault of a session and fails it.
async fn supervise(
    inner: Weak<ManagerInner>,
    session_id: String,
    mut faults: mpsc::Receiver<StreamError>,
    mut shutdown: watch::Receiver<bool>,
) {
    let cause = tokio::select! {
        cause = faults.recv() => cause,
        _ = shutdown.changed() => None,
    };
    if let (Some(cause), Some(inner)) = (cause, inner.upgrade()) {
        inner.fail_session(&session_id, cause).await;
    }
}
