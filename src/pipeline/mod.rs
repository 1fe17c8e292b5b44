//! Outbound transmission
//!
//! Sequenced frames go into a bounded `FrameQueue`; one drain worker per
//! session sends them, strictly in order, through the session's frame sink.
//! A full queue is reported as `Backpressure`, never absorbed silently.

mod queue;
mod retry;
mod transmit;

pub use queue::{EnqueueOutcome, FrameQueue};
pub use retry::RetryPolicy;
pub use transmit::{DrainReport, PipelineCounters, TransmissionPipeline, WorkerConfig};
