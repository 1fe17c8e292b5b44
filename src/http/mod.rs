//! HTTP control API
//!
//! - POST /sessions - Start a session, optionally streaming a WAV file into it
//! - POST /sessions/:id/frames - Push one raw PCM frame
//! - POST /sessions/:id/close - Drain and close a session
//! - GET /sessions/:id/status - Session statistics
//! - GET /sessions/:id/results - Recent classification results
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::{AppState, ResultLog, ResultLogs};
