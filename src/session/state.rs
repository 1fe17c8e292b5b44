use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a streaming session.
///
/// ```text
/// Created -> Authenticating -> Active -> Draining -> Closed
///    \             \              \          \
///     +-------------+--------------+----------+--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Allocated, no handshake yet
    Created,
    /// Handshake in flight
    Authenticating,
    /// Frames accepted and transmitted, results demultiplexed
    Active,
    /// Close requested: flushing queued frames and awaiting results
    Draining,
    /// Terminal success
    Closed,
    /// Terminal error
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// `Active` is the only state in which frames are accepted.
    pub fn accepts_frames(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Authenticating) => true,
            (Authenticating, Active) => true,
            (Active, Draining) => true,
            (Draining, Closed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
