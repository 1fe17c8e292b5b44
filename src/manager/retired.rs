use crate::session::{SessionState, SessionStats};
use std::collections::{HashMap, VecDeque};

/// Terminal sessions.
///
/// Every retired id is remembered with its final state so it is never handed
/// out again. Full stats are kept only for the most recent `history` sessions.
#[derive(Debug)]
pub(super) struct RetiredSessions {
    states: HashMap<String, SessionState>,
    stats: HashMap<String, SessionStats>,
    order: VecDeque<String>,
    history: usize,
}

impl RetiredSessions {
    pub fn new(history: usize) -> Self {
        Self {
            states: HashMap::new(),
            stats: HashMap::new(),
            order: VecDeque::new(),
            history,
        }
    }

    pub fn insert(&mut self, stats: SessionStats) {
        let id = stats.session_id.clone();
        self.states.insert(id.clone(), stats.state);
        if self.stats.insert(id.clone(), stats).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.history {
            if let Some(oldest) = self.order.pop_front() {
                self.stats.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.states.contains_key(session_id)
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.states.get(session_id).copied()
    }

    pub fn stats(&self, session_id: &str) -> Option<&SessionStats> {
        self.stats.get(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stats(id: &str, state: SessionState) -> SessionStats {
        SessionStats {
            session_id: id.to_string(),
            state,
            created_at: Utc::now(),
            authenticated_at: None,
            uptime_secs: 0.0,
            frames_accepted: 0,
            frames_late: 0,
            frames_sent: 0,
            queue_depth: 0,
            backpressure_events: 0,
            frames_dropped_oldest: 0,
            retries: 0,
            results_delivered: 0,
            results_unmatched: 0,
            results_duplicate: 0,
            results_missing: 0,
            outstanding: 0,
            events_undelivered: 0,
            failure: None,
        }
    }

    #[test]
    fn test_stats_history_is_bounded_but_ids_are_kept() {
        let mut retired = RetiredSessions::new(2);
        retired.insert(stats("a", SessionState::Closed));
        retired.insert(stats("b", SessionState::Failed));
        retired.insert(stats("c", SessionState::Closed));

        assert!(retired.stats("a").is_none());
        assert!(retired.stats("b").is_some());
        assert!(retired.stats("c").is_some());

        assert!(retired.contains("a"));
        assert_eq!(retired.state("a"), Some(SessionState::Closed));
        assert_eq!(retired.state("b"), Some(SessionState::Failed));
        assert!(!retired.contains("d"));
    }
}
