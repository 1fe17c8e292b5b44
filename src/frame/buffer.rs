use super::pcm::{normalize_peak, SampleFormat};
use crate::error::{Result, StreamError};
use crate::session::SessionConfig;
use std::sync::Arc;
use tokio::time::Instant;

/// One captured PCM unit, not yet sequenced
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub session_id: Arc<str>,
    /// Exactly `frame_bytes` of PCM
    pub pcm: Vec<u8>,
    /// Monotonic capture time in milliseconds since the session's epoch
    pub capture_timestamp_ms: u64,
}

#[derive(Debug)]
struct Binding {
    session_id: Arc<str>,
    frame_bytes: usize,
    normalize: bool,
    format: SampleFormat,
    epoch: Instant,
}

/// Validates raw capture buffers against the active session's frame size.
///
/// Unbound until a session becomes active; never blocks.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    binding: Option<Binding>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to an active session. The session's epoch starts now.
    pub fn bind(&mut self, session_id: &str, config: &SessionConfig) {
        self.binding = Some(Binding {
            session_id: Arc::from(session_id),
            frame_bytes: config.frame_bytes(),
            normalize: config.normalize,
            format: config.sample_format,
            epoch: Instant::now(),
        });
    }

    pub fn unbind(&mut self) {
        self.binding = None;
    }

    /// Capture a frame stamped with the current monotonic time.
    pub fn capture(&self, raw: &[u8]) -> Result<CapturedFrame> {
        let binding = self.binding.as_ref().ok_or(StreamError::NoActiveSession)?;
        let elapsed = binding.epoch.elapsed().as_millis() as u64;
        self.capture_at(raw, elapsed)
    }

    /// Capture a frame with a timestamp supplied by the capture source.
    pub fn capture_at(&self, raw: &[u8], capture_timestamp_ms: u64) -> Result<CapturedFrame> {
        let binding = self.binding.as_ref().ok_or(StreamError::NoActiveSession)?;

        if raw.len() != binding.frame_bytes {
            return Err(StreamError::FrameSizeMismatch {
                expected: binding.frame_bytes,
                actual: raw.len(),
            });
        }

        let mut pcm = raw.to_vec();
        if binding.normalize {
            normalize_peak(&mut pcm, binding.format);
        }

        Ok(CapturedFrame {
            session_id: Arc::clone(&binding.session_id),
            pcm,
            capture_timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(normalize: bool) -> SessionConfig {
        SessionConfig {
            frame_len: 4,
            hop_len: 4,
            normalize,
            auth_token: "t".into(),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_unbound_buffer_has_no_session() {
        let buffer = FrameBuffer::new();
        assert_eq!(buffer.capture(&[0; 4]), Err(StreamError::NoActiveSession));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut buffer = FrameBuffer::new();
        buffer.bind("s1", &config(false));
        assert_eq!(
            buffer.capture(&[0; 3]),
            Err(StreamError::FrameSizeMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_capture_tags_session_and_keeps_bytes() {
        let mut buffer = FrameBuffer::new();
        buffer.bind("s1", &config(false));
        let frame = buffer.capture_at(&[1, 2, 3, 4], 77).unwrap();
        assert_eq!(&*frame.session_id, "s1");
        assert_eq!(frame.pcm, vec![1, 2, 3, 4]);
        assert_eq!(frame.capture_timestamp_ms, 77);
    }

    #[test]
    fn test_capture_normalizes_when_configured() {
        let mut buffer = FrameBuffer::new();
        buffer.bind("s1", &config(true));
        let frame = buffer.capture_at(&[128, 160, 96, 128], 0).unwrap();
        assert_eq!(frame.pcm, vec![128, 255, 1, 128]);
    }

    #[test]
    fn test_unbind_stops_capture() {
        let mut buffer = FrameBuffer::new();
        buffer.bind("s1", &config(false));
        buffer.unbind();
        assert_eq!(buffer.capture(&[0; 4]), Err(StreamError::NoActiveSession));
    }
}
