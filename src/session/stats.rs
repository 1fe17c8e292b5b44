use super::state::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time statistics about a streaming session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    pub state: SessionState,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// When the backend accepted the handshake
    pub authenticated_at: Option<DateTime<Utc>>,

    /// Seconds since creation
    pub uptime_secs: f64,

    /// Frames that received a sequence number
    pub frames_accepted: u64,

    /// Frames flagged late by the sequencer
    pub frames_late: u64,

    /// Frames transmitted successfully
    pub frames_sent: u64,

    /// Frames waiting in the transmission queue (including one in flight)
    pub queue_depth: usize,

    /// Enqueue attempts refused with backpressure
    pub backpressure_events: u64,

    /// Unsent frames evicted by a drop-oldest capture policy
    pub frames_dropped_oldest: u64,

    /// Transmission retries after transient failures
    pub retries: u64,

    pub results_delivered: u64,
    pub results_unmatched: u64,
    pub results_duplicate: u64,

    /// Missing-result notifications emitted
    pub results_missing: u64,

    /// Sent frames still awaiting a result
    pub outstanding: usize,

    /// Results and missing-result notices matched but cut off before
    /// the consumer took them
    pub events_undelivered: u64,

    /// Failure cause when `state` is `Failed`
    pub failure: Option<String>,
}

/// Outcome of closing a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseReport {
    pub session_id: String,

    /// Terminal state reached (`Closed`, or `Failed` if the flush broke)
    pub state: SessionState,

    /// Total frames transmitted over the session's life
    pub frames_sent: u64,

    /// Frames flushed during the drain phase
    pub frames_flushed: u64,

    /// Queued frames dropped when the grace period expired
    pub frames_discarded: usize,

    /// Sent frames whose result never arrived before the forced close
    pub results_abandoned: usize,

    pub results_delivered: u64,

    /// Matched results the consumer never received
    pub events_undelivered: u64,

    /// Seconds spent between close request and terminal state
    pub drain_secs: f64,
}
