use crate::manager::{SessionHandle, SessionManager};
use crate::results::{ClassificationResult, SessionEvent};
use crate::session::SessionConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Results kept per session for the results endpoint
const DEFAULT_RESULT_HISTORY: usize = 256;

/// Ended sessions whose result logs are kept
const DEFAULT_FINISHED_HISTORY: usize = 64;

/// What the HTTP layer remembers about a session's event stream
#[derive(Debug, Default, Clone, Serialize)]
pub struct ResultLog {
    /// Most recent results, oldest first
    pub recent: VecDeque<ClassificationResult>,
    pub delivered: u64,
    pub missing: u64,
    /// Terminal event summary once the session has ended
    pub terminal: Option<String>,
}

/// Result logs of live and recently ended sessions
#[derive(Debug, Default)]
pub struct ResultLogs {
    logs: HashMap<String, ResultLog>,
    finished: VecDeque<String>,
}

impl ResultLogs {
    pub fn get(&self, session_id: &str) -> Option<&ResultLog> {
        self.logs.get(session_id)
    }

    /// Mark a session's log as final, evicting the oldest ended logs past `keep`.
    fn finish(&mut self, session_id: &str, keep: usize) {
        self.finished.push_back(session_id.to_string());
        while self.finished.len() > keep {
            if let Some(oldest) = self.finished.pop_front() {
                self.logs.remove(&oldest);
            }
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    /// Applied to fields a start request leaves out
    pub defaults: Arc<SessionConfig>,
    pub results: Arc<RwLock<ResultLogs>>,
    pub result_history: usize,
    pub finished_history: usize,
}

impl AppState {
    pub fn new(manager: SessionManager, defaults: SessionConfig) -> Self {
        Self {
            manager,
            defaults: Arc::new(defaults),
            results: Arc::new(RwLock::new(ResultLogs::default())),
            result_history: DEFAULT_RESULT_HISTORY,
            finished_history: DEFAULT_FINISHED_HISTORY,
        }
    }

    /// Drain a session's events into its result log until the session ends.
    pub async fn track(&self, handle: SessionHandle) {
        let SessionHandle {
            session_id,
            mut events,
        } = handle;
        self.results
            .write()
            .await
            .logs
            .insert(session_id.clone(), ResultLog::default());

        let results = Arc::clone(&self.results);
        let history = self.result_history.max(1);
        let keep_finished = self.finished_history.max(1);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                let mut logs = results.write().await;
                let Some(log) = logs.logs.get_mut(&session_id) else {
                    break;
                };
                match event {
                    SessionEvent::Active { .. } => {}
                    SessionEvent::Result(result) => {
                        log.delivered += 1;
                        log.recent.push_back(result);
                        while log.recent.len() > history {
                            log.recent.pop_front();
                        }
                    }
                    SessionEvent::MissingResult(_) => log.missing += 1,
                    SessionEvent::Closed(report) => {
                        log.terminal = Some(format!("closed: {} frames sent", report.frames_sent));
                    }
                    SessionEvent::Failed { cause, .. } => {
                        log.terminal = Some(format!("failed: {cause}"));
                    }
                }
                if terminal {
                    logs.finish(&session_id, keep_finished);
                    break;
                }
            }
            debug!(%session_id, "Event collector stopped");
        });
    }
}
