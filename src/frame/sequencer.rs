use super::buffer::CapturedFrame;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Frames spaced further apart than this many hop durations are flagged late
pub const DEFAULT_LATE_TOLERANCE: f64 = 2.0;

/// A frame with its per-session sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedFrame {
    pub session_id: Arc<str>,
    /// Strictly increasing from 0 within the session
    pub sequence: u64,
    pub pcm: Vec<u8>,
    pub capture_timestamp_ms: u64,
    /// Arrived later than the hop timing allows; kept, only tagged
    pub late: bool,
}

/// Assigns sequence numbers and checks hop spacing for one session.
///
/// The counter starts at 0 and never resets; a new session gets a new
/// sequencer. Callers serialize access through the session's lock.
#[derive(Debug)]
pub struct FrameSequencer {
    next_sequence: u64,
    last_capture_ms: Option<u64>,
    /// Largest plausible gap between frames, in milliseconds
    late_threshold_ms: f64,
    late_frames: u64,
}

impl FrameSequencer {
    pub fn new(hop: Duration, tolerance: f64) -> Self {
        Self {
            next_sequence: 0,
            last_capture_ms: None,
            late_threshold_ms: hop.as_secs_f64() * 1000.0 * tolerance.max(1.0),
            late_frames: 0,
        }
    }

    /// Sequence the next accepted frame.
    pub fn next(&mut self, frame: CapturedFrame) -> SequencedFrame {
        let late = match self.last_capture_ms {
            Some(previous) => {
                let gap = frame.capture_timestamp_ms.saturating_sub(previous) as f64;
                gap > self.late_threshold_ms
            }
            None => false,
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.last_capture_ms = Some(frame.capture_timestamp_ms);

        if late {
            self.late_frames += 1;
            warn!(
                session_id = %frame.session_id,
                sequence,
                threshold_ms = self.late_threshold_ms,
                "Frame arrived late for hop timing"
            );
        }

        SequencedFrame {
            session_id: frame.session_id,
            sequence,
            pcm: frame.pcm,
            capture_timestamp_ms: frame.capture_timestamp_ms,
            late,
        }
    }

    /// Number of frames sequenced so far (also the next sequence number)
    pub fn accepted(&self) -> u64 {
        self.next_sequence
    }

    pub fn late_frames(&self) -> u64 {
        self.late_frames
    }
}
