//! Capture sources
//!
//! Capture is an external collaborator: anything that yields fixed-size PCM
//! buffers. `SessionManager::run_capture` pulls from a `CaptureSource` and
//! decides what to do on backpressure according to a `BackpressurePolicy`.

mod channel;
mod wav;

pub use channel::ChannelSource;
pub use wav::WavFileSource;

use crate::error::CaptureError;
use serde::{Deserialize, Serialize};

/// A pull source of fixed-size PCM buffers
#[async_trait::async_trait]
pub trait CaptureSource: Send {
    /// Next PCM buffer, or `None` once the source is exhausted
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;

    /// Source name for logging
    fn name(&self) -> &str;
}

/// What the capture loop does when the transmission queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Discard the frame just captured
    #[default]
    DropNewest,
    /// Discard the oldest unsent frame and retry
    DropOldest,
    /// Wait for room, holding up capture
    Wait,
}

/// Totals from one capture run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub frames_read: u64,
    pub frames_accepted: u64,
    /// Frames dropped under backpressure (either end)
    pub frames_dropped: u64,
    /// Buffers rejected for having the wrong size
    pub frames_rejected: u64,
    /// Read error that ended capture after frames had been produced
    pub capture_error: Option<String>,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "drop_newest" => Ok(Self::DropNewest),
            "drop_oldest" => Ok(Self::DropOldest),
            "wait" => Ok(Self::Wait),
            other => Err(format!(
                "unknown backpressure policy '{other}' (expected drop-newest, drop-oldest or wait)"
            )),
        }
    }
}
