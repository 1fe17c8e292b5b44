use super::types::ClassificationResult;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a single inbound result was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    /// Matched an outstanding frame; hand it to the sink
    Delivered,
    /// No outstanding frame with this sequence number (or wrong session)
    Unmatched,
    /// This sequence number was already delivered
    Duplicate,
}

/// A sent frame whose result has not shown up in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingResult {
    pub session_id: String,
    pub sequence: u64,
    /// Overtaken by a later result but never answered, as opposed to
    /// pushed out of the outstanding window
    pub overtaken: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DemuxCounters {
    pub delivered: u64,
    pub unmatched: u64,
    pub duplicate: u64,
    pub missing: u64,
}

#[derive(Debug)]
struct Pending {
    /// Set when a later sequence number is answered first
    overtaken_at: Option<Instant>,
    reported: bool,
}

#[derive(Debug, Default)]
struct DemuxState {
    outstanding: BTreeMap<u64, Pending>,
    delivered: BTreeSet<u64>,
    /// Evicted from the window before being answered or reported
    expired: Vec<u64>,
    counters: DemuxCounters,
}

/// Correlates inbound results with the frames one session has sent.
///
/// Results are delivered in arrival order; gaps are reported, never waited on.
#[derive(Debug)]
pub struct ResultDemultiplexer {
    session_id: Arc<str>,
    /// Maximum number of outstanding sequence numbers tracked
    window: usize,
    gap_timeout: Duration,
    state: Mutex<DemuxState>,
    settled: Notify,
}

impl ResultDemultiplexer {
    pub fn new(session_id: &str, window: usize, gap_timeout: Duration) -> Self {
        Self {
            session_id: Arc::from(session_id),
            window: window.max(1),
            gap_timeout,
            state: Mutex::new(DemuxState::default()),
            settled: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DemuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a frame as sent and awaiting its result.
    pub fn register_sent(&self, sequence: u64) {
        let mut state = self.lock();
        state.outstanding.insert(
            sequence,
            Pending {
                overtaken_at: None,
                reported: false,
            },
        );

        while state.outstanding.len() > self.window {
            if let Some((oldest, pending)) = state.outstanding.pop_first() {
                if !pending.reported {
                    state.expired.push(oldest);
                }
            }
        }
    }

    /// Classify an inbound result.
    pub fn on_result(&self, result: &ClassificationResult, now: Instant) -> ResultOutcome {
        if result.session_id.as_str() != &*self.session_id {
            warn!(
                session_id = %self.session_id,
                foreign = %result.session_id,
                sequence = result.sequence,
                "Result addressed to another session"
            );
            self.lock().counters.unmatched += 1;
            return ResultOutcome::Unmatched;
        }

        let mut state = self.lock();
        let sequence = result.sequence;

        if state.outstanding.remove(&sequence).is_some() {
            state.delivered.insert(sequence);
            while state.delivered.len() > self.window * 2 {
                state.delivered.pop_first();
            }
            for (_, pending) in state.outstanding.range_mut(..sequence) {
                pending.overtaken_at.get_or_insert(now);
            }
            state.counters.delivered += 1;
            if state.outstanding.is_empty() {
                self.settled.notify_waiters();
            }
            debug!(session_id = %self.session_id, sequence, "Result delivered");
            return ResultOutcome::Delivered;
        }

        if state.delivered.contains(&sequence) {
            state.counters.duplicate += 1;
            debug!(session_id = %self.session_id, sequence, "Duplicate result dropped");
            return ResultOutcome::Duplicate;
        }

        state.counters.unmatched += 1;
        warn!(
            session_id = %self.session_id,
            sequence,
            "Result does not match any outstanding frame"
        );
        ResultOutcome::Unmatched
    }

    /// Collect gaps that have waited longer than the gap timeout.
    ///
    /// Each sequence number is reported at most once. A reported frame stays
    /// outstanding, so a late result is still delivered.
    pub fn sweep(&self, now: Instant) -> Vec<MissingResult> {
        let mut state = self.lock();
        let mut missing: Vec<MissingResult> = state
            .expired
            .drain(..)
            .map(|sequence| MissingResult {
                session_id: self.session_id.to_string(),
                sequence,
                overtaken: false,
            })
            .collect();

        for (&sequence, pending) in state.outstanding.iter_mut() {
            if pending.reported {
                continue;
            }
            if let Some(since) = pending.overtaken_at {
                if now.saturating_duration_since(since) >= self.gap_timeout {
                    pending.reported = true;
                    missing.push(MissingResult {
                        session_id: self.session_id.to_string(),
                        sequence,
                        overtaken: true,
                    });
                }
            }
        }

        state.counters.missing += missing.len() as u64;
        missing
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn counters(&self) -> DemuxCounters {
        self.lock().counters
    }

    /// Wait until every sent frame has been answered, or the grace period ends.
    ///
    /// Returns true if nothing is outstanding.
    pub async fn wait_settled(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding() == 0;
            }
        }
    }

    /// Give up on every outstanding result; returns how many were abandoned.
    pub fn abandon(&self) -> usize {
        let mut state = self.lock();
        let abandoned = state.outstanding.len();
        state.outstanding.clear();
        state.expired.clear();
        abandoned
    }
}
