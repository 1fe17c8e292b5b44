use crate::error::TransportError;
use crate::frame::{SampleFormat, SequencedFrame};
use crate::results::ClassificationResult;
use crate::session::SessionConfig;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Session start request sent during the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client-proposed session id
    pub session_id: String,
    pub sample_rate_hz: u32,
    pub frame_len: u32,
    pub hop_len: u32,
    pub channels: u32,
    pub normalize: bool,
    pub sample_format: SampleFormat,
    pub auth_token: String,
}

impl HandshakeRequest {
    pub fn new(session_id: &str, config: &SessionConfig) -> Self {
        Self {
            session_id: session_id.to_string(),
            sample_rate_hz: config.sample_rate_hz,
            frame_len: config.frame_len,
            hop_len: config.hop_len,
            channels: config.channels,
            normalize: config.normalize,
            sample_format: config.sample_format,
            auth_token: config.auth_token.clone(),
        }
    }
}

/// Backend reply to a session start request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub accepted: bool,
    /// Authoritative session id when accepted
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl HandshakeReply {
    pub fn accepted(session_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            session_id: Some(session_id.into()),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            session_id: None,
            reason: Some(reason.into()),
        }
    }

    /// Resolve into the assigned session id or a rejection.
    pub fn into_session_id(self) -> Result<String, TransportError> {
        if !self.accepted {
            return Err(TransportError::Rejected(
                self.reason.unwrap_or_else(|| "handshake rejected".to_string()),
            ));
        }
        self.session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransportError::Protocol("accepted reply without session id".into()))
    }
}

/// Audio frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFrameMessage {
    pub session_id: String,
    pub sequence: u64,
    pub pcm: String, // Base64-encoded PCM bytes
    pub timestamp_ms: u64,
    #[serde(default)]
    pub late: bool,
    #[serde(rename = "final")]
    pub final_frame: bool,
}

impl AudioFrameMessage {
    pub fn from_frame(frame: &SequencedFrame) -> Self {
        Self {
            session_id: frame.session_id.to_string(),
            sequence: frame.sequence,
            pcm: base64::engine::general_purpose::STANDARD.encode(&frame.pcm),
            timestamp_ms: frame.capture_timestamp_ms,
            late: frame.late,
            final_frame: false,
        }
    }

    /// End-of-stream marker carrying the next unused sequence number
    pub fn end_of_stream(session_id: &str, next_sequence: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence: next_sequence,
            pcm: String::new(),
            timestamp_ms: 0,
            late: false,
            final_frame: true,
        }
    }

    pub fn decode_pcm(&self) -> Result<Vec<u8>, TransportError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.pcm)
            .map_err(|e| TransportError::Protocol(format!("invalid pcm payload: {e}")))
    }
}

/// Classification scores for one frame, as sent by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub session_id: String,
    pub sequence: u64,
    pub values: Vec<f32>,
}

impl ResultMessage {
    /// Stamp the arrival time.
    pub fn into_result(self) -> ClassificationResult {
        ClassificationResult {
            session_id: self.session_id,
            sequence: self.sequence,
            values: self.values,
            received_at: Utc::now(),
        }
    }
}
