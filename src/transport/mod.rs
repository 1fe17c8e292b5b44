//! Transport collaborators
//!
//! A `Transport` performs the session handshake and opens one exclusive
//! channel per session: an outbound `FrameSink` and an inbound stream of
//! result messages. Two implementations are provided:
//! - `NatsTransport`: JSON messages over NATS subjects
//! - `LoopbackTransport`: an in-process backend for tests and offline runs

pub mod loopback;
pub mod messages;
pub mod nats;

pub use loopback::{LoopbackOptions, LoopbackTransport};
pub use messages::{AudioFrameMessage, HandshakeReply, HandshakeRequest, ResultMessage};
pub use nats::NatsTransport;

use crate::error::TransportError;
use crate::frame::SequencedFrame;
use futures::stream::BoxStream;

/// Inbound result messages for one session
pub type ResultStream = BoxStream<'static, Result<ResultMessage, TransportError>>;

/// Per-session channel pair, owned exclusively by that session
pub struct SessionChannel {
    pub outbound: Box<dyn FrameSink>,
    pub inbound: ResultStream,
}

/// Outbound half of a session channel
#[async_trait::async_trait]
pub trait FrameSink: Send {
    /// Transmit one frame. Fire-and-forget: the result stream is the ack.
    async fn send(&mut self, frame: &SequencedFrame) -> Result<(), TransportError>;

    /// Signal end of stream after the last frame.
    async fn finish(&mut self, next_sequence: u64) -> Result<(), TransportError>;
}

/// Connection to an inference backend
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Present the session config and credential.
    ///
    /// Returns the backend-assigned session id, or `TransportError::Rejected`.
    async fn handshake(&self, request: &HandshakeRequest) -> Result<String, TransportError>;

    /// Open the frame sink and result stream for an authenticated session.
    async fn open(&self, session_id: &str) -> Result<SessionChannel, TransportError>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
