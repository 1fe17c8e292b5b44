//! Inbound classification results
//!
//! Results arriving from the backend are matched against the sequence
//! numbers a session has sent, then handed to the caller's event sink in
//! arrival order together with lifecycle and missing-result notifications.

mod demux;
mod events;
mod types;

pub use demux::{DemuxCounters, MissingResult, ResultDemultiplexer, ResultOutcome};
pub use events::{EventSink, SessionEvent};
pub use types::ClassificationResult;
