use super::config::SessionConfig;
use super::state::SessionState;
use crate::error::{Result, StreamError};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// A streaming session: identity, negotiated config, lifecycle state.
///
/// A plain value. The `SessionManager` owns it and drives every transition.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier; provisional until the handshake assigns one
    id: String,

    config: SessionConfig,

    state: SessionState,

    /// When the session object was allocated
    created_at: DateTime<Utc>,

    /// When the backend accepted the credential
    authenticated_at: Option<DateTime<Utc>>,

    /// Cause of the transition into `Failed`
    failure: Option<StreamError>,
}

impl Session {
    /// Allocate a session in the `Created` state with a client-proposed id.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_id(format!("sess-{}", uuid::Uuid::new_v4()), config)
    }

    pub fn with_id(id: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            id: id.into(),
            config,
            state: SessionState::Created,
            created_at: Utc::now(),
            authenticated_at: None,
            failure: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn authenticated_at(&self) -> Option<DateTime<Utc>> {
        self.authenticated_at
    }

    pub fn failure(&self) -> Option<&StreamError> {
        self.failure.as_ref()
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(StreamError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(session_id = %self.id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        Ok(())
    }

    /// Record a successful handshake: adopt the server-assigned id and go `Active`.
    pub fn authenticate(&mut self, assigned_id: String) -> Result<()> {
        self.transition(SessionState::Active)?;
        if assigned_id != self.id {
            info!(provisional = %self.id, assigned = %assigned_id, "Backend assigned session id");
            self.id = assigned_id;
        }
        self.authenticated_at = Some(Utc::now());
        Ok(())
    }

    /// Drive the session to `Failed`, keeping the first cause.
    ///
    /// Returns false if the session was already terminal.
    pub fn fail(&mut self, cause: StreamError) -> bool {
        if self.transition(SessionState::Failed).is_err() {
            return false;
        }
        self.failure.get_or_insert(cause);
        true
    }
}
