use crate::error::{Result, StreamError};
use crate::frame::SampleFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Audio span the default transmission queue is sized to hold
const DEFAULT_QUEUE_SPAN: Duration = Duration::from_millis(200);

/// Configuration negotiated for a streaming session.
///
/// Immutable once the session is established.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capture sample rate in Hz
    pub sample_rate_hz: u32,

    /// Samples per frame (per channel)
    pub frame_len: u32,

    /// Samples between successive frame starts; drives late-frame detection
    pub hop_len: u32,

    /// Number of interleaved channels
    pub channels: u32,

    /// Apply peak amplitude normalization before transmission
    pub normalize: bool,

    /// PCM encoding of frame payloads
    #[serde(default)]
    pub sample_format: SampleFormat,

    /// Credential presented during the handshake
    pub auth_token: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16000,
            frame_len: 256,
            hop_len: 256,
            channels: 1,
            normalize: true,
            sample_format: SampleFormat::Pcm8,
            auth_token: String::new(),
        }
    }
}

// Keeps the credential out of logs.
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("frame_len", &self.frame_len)
            .field("hop_len", &self.hop_len)
            .field("channels", &self.channels)
            .field("normalize", &self.normalize)
            .field("sample_format", &self.sample_format)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

impl SessionConfig {
    /// Check every field against its invariant.
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &'static str, reason: &str) -> StreamError {
            StreamError::ConfigInvalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.sample_rate_hz == 0 {
            return Err(invalid("sample_rate_hz", "must be greater than zero"));
        }
        if self.frame_len == 0 {
            return Err(invalid("frame_len", "must be greater than zero"));
        }
        if self.hop_len == 0 {
            return Err(invalid("hop_len", "must be greater than zero"));
        }
        if self.channels == 0 {
            return Err(invalid("channels", "must be at least 1"));
        }
        if self.auth_token.is_empty() {
            return Err(invalid("auth_token", "must not be empty"));
        }
        if self.checked_frame_bytes().is_none() {
            return Err(invalid("frame_len", "frame size overflows"));
        }
        if self.hop_len > self.frame_len {
            tracing::warn!(
                hop_len = self.hop_len,
                frame_len = self.frame_len,
                "hop length exceeds frame length; frames will not cover the signal"
            );
        }
        Ok(())
    }

    fn checked_frame_bytes(&self) -> Option<usize> {
        (self.frame_len as usize)
            .checked_mul(self.channels as usize)?
            .checked_mul(self.sample_format.width())
    }

    /// Exact payload length of one frame: frame_len × channels × sample width.
    pub fn frame_bytes(&self) -> usize {
        self.frame_len as usize * self.channels as usize * self.sample_format.width()
    }

    /// Nominal spacing between frame starts.
    pub fn hop_duration(&self) -> Duration {
        let rate = self.sample_rate_hz.max(1) as u64;
        Duration::from_nanos(self.hop_len as u64 * 1_000_000_000 / rate)
    }

    /// Queue capacity covering ~200ms of audio at this session's hop rate.
    pub fn default_queue_capacity(&self) -> usize {
        let hops_per_sec = self.sample_rate_hz as f64 / self.hop_len.max(1) as f64;
        ((DEFAULT_QUEUE_SPAN.as_secs_f64() * hops_per_sec).ceil() as usize).max(1)
    }
}
