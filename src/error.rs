//! Error types for the streaming engine.
//!
//! Fatal and structural failures are `StreamError` values. Advisory conditions
//! (backpressure, unmatched or duplicate results, missing results) are not
//! errors: they are returned as outcome enums or delivered as session events.

use crate::session::SessionState;
use thiserror::Error;

/// Errors surfaced by the session manager and its components.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// A `SessionConfig` value violates its invariants; rejected before any handshake.
    #[error("Invalid session config: {field} {reason}")]
    ConfigInvalid { field: &'static str, reason: String },

    #[error("Authentication rejected for session {session_id}: {reason}")]
    AuthRejected { session_id: String, reason: String },

    #[error("Handshake for session {session_id} timed out after {timeout_ms}ms")]
    HandshakeTimeout { session_id: String, timeout_ms: u64 },

    #[error("No active session")]
    NoActiveSession,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {session_id} is {state}, not accepting frames")]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error("Transmission of frame {sequence} failed after {attempts} attempts: {cause}")]
    TransmissionFailed {
        sequence: u64,
        attempts: u32,
        cause: TransportError,
    },

    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Inference backend disconnected from session {0}")]
    BackendDisconnected(String),

    #[error("Session id {0} is already in use or retired")]
    SessionIdReused(String),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors reported by a transport collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The backend refused the handshake (bad credential, unsupported config).
    #[error("rejected by backend: {0}")]
    Rejected(String),

    #[error("timed out")]
    Timeout,

    /// Transient delivery failure; worth retrying.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("channel closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encoding error: {0}")]
    Encode(String),
}

impl TransportError {
    /// Returns true if the failed operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Unavailable(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Encode(err.to_string())
    }
}

/// Errors from a capture source.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture read failed: {0}")]
    ReadFailed(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
