//! Frame capture and sequencing
//!
//! Raw PCM buffers enter through a `FrameBuffer`, which checks their size
//! against the session config and stamps them with a monotonic capture time.
//! The `FrameSequencer` then assigns per-session sequence numbers and flags
//! frames that arrive implausibly late for the configured hop.

mod buffer;
pub mod pcm;
mod sequencer;

pub use buffer::{CapturedFrame, FrameBuffer};
pub use pcm::{normalize_peak, SampleFormat};
pub use sequencer::{FrameSequencer, SequencedFrame, DEFAULT_LATE_TOLERANCE};
