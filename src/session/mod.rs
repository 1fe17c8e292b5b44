//! Session lifecycle values
//!
//! This module provides the data side of a streaming session:
//! - `SessionConfig`: negotiated audio parameters and credential
//! - `SessionState`: the lifecycle state machine
//! - `Session`: identity, config, state and failure cause
//! - `SessionStats` / `CloseReport`: snapshots reported to callers
//!
//! Sessions are mutated only by the `SessionManager`.

mod config;
mod session;
mod state;
mod stats;

pub use config::SessionConfig;
pub use session::Session;
pub use state::SessionState;
pub use stats::{CloseReport, SessionStats};
