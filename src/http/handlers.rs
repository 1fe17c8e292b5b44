use super::state::AppState;
use crate::capture::{BackpressurePolicy, WavFileSource};
use crate::error::StreamError;
use crate::frame::SampleFormat;
use crate::pipeline::EnqueueOutcome;
use crate::session::{SessionConfig, SessionState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Session parameters; anything left out comes from the service defaults.
#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    pub auth_token: Option<String>,
    pub sample_rate_hz: Option<u32>,
    pub frame_len: Option<u32>,
    pub hop_len: Option<u32>,
    pub channels: Option<u32>,
    pub normalize: Option<bool>,
    pub sample_format: Option<SampleFormat>,

    /// WAV file to stream into the session; the session closes when it ends
    pub wav_path: Option<String>,

    /// Release WAV frames at the hop interval instead of as fast as possible
    #[serde(default)]
    pub paced: bool,

    #[serde(default)]
    pub policy: BackpressurePolicy,
}

impl StartSessionRequest {
    fn session_config(&self, defaults: &SessionConfig) -> SessionConfig {
        SessionConfig {
            sample_rate_hz: self.sample_rate_hz.unwrap_or(defaults.sample_rate_hz),
            frame_len: self.frame_len.unwrap_or(defaults.frame_len),
            hop_len: self.hop_len.unwrap_or(defaults.hop_len),
            channels: self.channels.unwrap_or(defaults.channels),
            normalize: self.normalize.unwrap_or(defaults.normalize),
            sample_format: self.sample_format.unwrap_or(defaults.sample_format),
            auth_token: self
                .auth_token
                .clone()
                .unwrap_or_else(|| defaults.auth_token.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub state: SessionState,
    /// True when a WAV file is being streamed into the session
    pub streaming: bool,
}

#[derive(Debug, Serialize)]
pub struct PushFrameResponse {
    pub session_id: String,
    pub sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn stream_error_response(err: &StreamError) -> Response {
    let status = match err {
        StreamError::ConfigInvalid { .. } | StreamError::FrameSizeMismatch { .. } => {
            StatusCode::BAD_REQUEST
        }
        StreamError::AuthRejected { .. } => StatusCode::UNAUTHORIZED,
        StreamError::HandshakeTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        StreamError::UnknownSession(_) => StatusCode::NOT_FOUND,
        StreamError::SessionClosed { .. }
        | StreamError::NoActiveSession
        | StreamError::SessionIdReused(_)
        | StreamError::InvalidTransition { .. } => StatusCode::CONFLICT,
        StreamError::TransmissionFailed { .. }
        | StreamError::BackendDisconnected(_)
        | StreamError::Transport(_) => StatusCode::BAD_GATEWAY,
        StreamError::CaptureUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions
/// Start a session, optionally streaming a WAV file into it
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> Response {
    let config = req.session_config(&state.defaults);
    if let Err(e) = config.validate() {
        return stream_error_response(&e);
    }

    let source = match &req.wav_path {
        Some(path) => {
            let path = shellexpand::tilde(path);
            match WavFileSource::open(&*path, &config, req.paced) {
                Ok(source) => Some(source),
                Err(e) => {
                    error!("Failed to open WAV source {}: {}", path, e);
                    return error_response(StatusCode::BAD_REQUEST, e);
                }
            }
        }
        None => None,
    };

    let handle = match state.manager.start_session(config).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start session: {}", e);
            return stream_error_response(&e);
        }
    };
    let session_id = handle.session_id.clone();
    state.track(handle).await;

    let streaming = source.is_some();
    if let Some(mut source) = source {
        let manager = state.manager.clone();
        let id = session_id.clone();
        let policy = req.policy;
        tokio::spawn(async move {
            match manager.run_capture(&id, &mut source, policy).await {
                Ok(summary) => info!(
                    session_id = %id,
                    accepted = summary.frames_accepted,
                    dropped = summary.frames_dropped,
                    "WAV capture complete"
                ),
                Err(e) => {
                    warn!(session_id = %id, "WAV capture stopped: {}", e);
                    return;
                }
            }
            if let Err(e) = manager.close_session(&id).await {
                warn!(session_id = %id, "Failed to close session after capture: {}", e);
            }
        });
    }

    info!("Session started: {}", session_id);
    (
        StatusCode::CREATED,
        Json(StartSessionResponse {
            session_id,
            state: SessionState::Active,
            streaming,
        }),
    )
        .into_response()
}

/// POST /sessions/:session_id/frames
/// Push one raw PCM frame (request body)
pub async fn push_frame(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Response {
    match state.manager.push(&session_id, &body) {
        Ok(EnqueueOutcome::Accepted { sequence }) => (
            StatusCode::ACCEPTED,
            Json(PushFrameResponse {
                session_id,
                sequence,
            }),
        )
            .into_response(),
        Ok(EnqueueOutcome::Backpressure) => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "transmission queue full; frame not accepted",
        ),
        Ok(EnqueueOutcome::Closed) => {
            error_response(StatusCode::CONFLICT, "transmission queue closed")
        }
        Err(e) => stream_error_response(&e),
    }
}

/// POST /sessions/:session_id/close
/// Drain and close a session
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    info!("Closing session: {}", session_id);
    match state.manager.close_session(&session_id).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            error!("Failed to close session {}: {}", session_id, e);
            stream_error_response(&e)
        }
    }
}

/// GET /sessions/:session_id/status
pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.manager.stats(&session_id) {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => stream_error_response(&e),
    }
}

/// GET /sessions/:session_id/results
/// Recent results collected from the session's event stream
pub async fn session_results(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let logs = state.results.read().await;
    match logs.get(&session_id) {
        Some(log) => (StatusCode::OK, Json(log)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("Session {} not found", session_id),
        ),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
