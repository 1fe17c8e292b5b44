//! In-process inference backend.
//!
//! Accepts a fixed set of tokens, records every frame it receives, and
//! answers each frame with a deterministic score vector derived from the
//! frame's energy. Failures, stalls and disconnects can be injected.

use super::messages::{AudioFrameMessage, HandshakeRequest, ResultMessage};
use super::{FrameSink, SessionChannel, Transport};
use crate::error::TransportError;
use crate::frame::{SampleFormat, SequencedFrame};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

type Inbound = mpsc::UnboundedSender<Result<ResultMessage, TransportError>>;

/// Behaviour of the loopback backend
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Credentials the handshake accepts
    pub accepted_tokens: Vec<String>,
    /// Scores per result
    pub classes: usize,
    /// Answer every received frame with a result
    pub respond: bool,
    /// Artificial handshake latency
    pub handshake_delay: Duration,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            accepted_tokens: vec!["secret123".to_string()],
            classes: 4,
            respond: true,
            handshake_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct LoopbackSession {
    received: Vec<AudioFrameMessage>,
    finished_at: Option<u64>,
    inbound: Option<Inbound>,
    format: SampleFormat,
}

#[derive(Clone)]
struct Shared {
    sessions: Arc<Mutex<HashMap<String, LoopbackSession>>>,
    failures: Arc<AtomicU32>,
    paused: Arc<watch::Sender<bool>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, LoopbackSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport backed by an in-process simulated backend
pub struct LoopbackTransport {
    options: LoopbackOptions,
    shared: Shared,
    next_id: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(options: LoopbackOptions) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            options,
            shared: Shared {
                sessions: Arc::new(Mutex::new(HashMap::new())),
                failures: Arc::new(AtomicU32::new(0)),
                paused: Arc::new(paused),
            },
            next_id: AtomicU64::new(1),
        }
    }

    /// Sequence numbers received for a session, in arrival order
    pub fn received(&self, session_id: &str) -> Vec<u64> {
        self.shared
            .lock()
            .get(session_id)
            .map(|s| s.received.iter().map(|m| m.sequence).collect())
            .unwrap_or_default()
    }

    /// Sequence carried by the end-of-stream marker, once received
    pub fn finished_at(&self, session_id: &str) -> Option<u64> {
        self.shared.lock().get(session_id).and_then(|s| s.finished_at)
    }

    /// Make the next `count` sends fail with a transient error.
    pub fn fail_next_sends(&self, count: u32) {
        self.shared.failures.store(count, Ordering::SeqCst);
    }

    /// Hold every send until `resume_sends` is called.
    pub fn pause_sends(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume_sends(&self) {
        self.shared.paused.send_replace(false);
    }

    /// Push a raw result into a session's inbound stream.
    pub fn inject_result(&self, session_id: &str, message: ResultMessage) -> bool {
        self.shared
            .lock()
            .get(session_id)
            .and_then(|s| s.inbound.as_ref())
            .map(|tx| tx.send(Ok(message)).is_ok())
            .unwrap_or(false)
    }

    /// Push an undecodable message into a session's inbound stream.
    pub fn inject_garbage(&self, session_id: &str) -> bool {
        self.shared
            .lock()
            .get(session_id)
            .and_then(|s| s.inbound.as_ref())
            .map(|tx| {
                tx.send(Err(TransportError::Protocol("garbage".into())))
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Drop the backend side of a session's result stream.
    pub fn disconnect(&self, session_id: &str) {
        if let Some(session) = self.shared.lock().get_mut(session_id) {
            session.inbound = None;
        }
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<String, TransportError> {
        if !self.options.handshake_delay.is_zero() {
            tokio::time::sleep(self.options.handshake_delay).await;
        }

        if !self.options.accepted_tokens.contains(&request.auth_token) {
            info!(proposed = %request.session_id, "Loopback backend rejected credential");
            return Err(TransportError::Rejected("invalid auth token".to_string()));
        }

        let session_id = format!("loopback-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.shared.lock().insert(
            session_id.clone(),
            LoopbackSession {
                format: request.sample_format,
                ..LoopbackSession::default()
            },
        );

        info!(%session_id, "Loopback backend accepted session");
        Ok(session_id)
    }

    async fn open(&self, session_id: &str) -> Result<SessionChannel, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut sessions = self.shared.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| TransportError::Protocol(format!("unknown session {session_id}")))?;
            session.inbound = Some(tx);
        }

        let inbound = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();

        let outbound = LoopbackSink {
            session_id: session_id.to_string(),
            shared: self.shared.clone(),
            paused: self.shared.paused.subscribe(),
            classes: self.options.classes,
            respond: self.options.respond,
        };

        Ok(SessionChannel {
            outbound: Box::new(outbound),
            inbound,
        })
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

struct LoopbackSink {
    session_id: String,
    shared: Shared,
    paused: watch::Receiver<bool>,
    classes: usize,
    respond: bool,
}

#[async_trait::async_trait]
impl FrameSink for LoopbackSink {
    async fn send(&mut self, frame: &SequencedFrame) -> Result<(), TransportError> {
        if self.paused.wait_for(|paused| !*paused).await.is_err() {
            return Err(TransportError::Closed);
        }

        let injected = self
            .shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Unavailable("injected failure".to_string()));
        }

        // Round-trip through the wire encoding, as a remote backend would see it.
        let message = AudioFrameMessage::from_frame(frame);
        let pcm = message.decode_pcm()?;

        let mut sessions = self.shared.lock();
        let session = sessions.get_mut(&self.session_id).ok_or(TransportError::Closed)?;
        let format = session.format;
        session.received.push(message);

        if self.respond {
            if let Some(inbound) = &session.inbound {
                let reply = ResultMessage {
                    session_id: self.session_id.clone(),
                    sequence: frame.sequence,
                    values: energy_scores(&pcm, format, self.classes),
                };
                if inbound.send(Ok(reply)).is_err() {
                    debug!(session_id = %self.session_id, "Result stream closed");
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self, next_sequence: u64) -> Result<(), TransportError> {
        let mut sessions = self.shared.lock();
        let session = sessions.get_mut(&self.session_id).ok_or(TransportError::Closed)?;
        session.finished_at = Some(next_sequence);
        Ok(())
    }
}

/// Scores peaking at the class bucket matching the frame's mean amplitude.
fn energy_scores(pcm: &[u8], format: SampleFormat, classes: usize) -> Vec<f32> {
    let classes = classes.max(1);
    let energy = match format {
        SampleFormat::Pcm8 => {
            let sum: f32 = pcm.iter().map(|&b| (b as f32 - 128.0).abs() / 128.0).sum();
            sum / pcm.len().max(1) as f32
        }
        SampleFormat::Pcm16Le => {
            let samples = pcm.chunks_exact(2);
            let count = samples.len().max(1);
            let sum: f32 = samples
                .map(|c| (i16::from_le_bytes([c[0], c[1]]) as f32).abs() / 32768.0)
                .sum();
            sum / count as f32
        }
    };

    let span = (classes - 1).max(1) as f32;
    (0..classes)
        .map(|k| {
            let centre = k as f32 / span;
            -(energy - centre).powi(2)
        })
        .collect()
}
