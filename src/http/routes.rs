use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Session lifecycle
        .route("/sessions", post(handlers::start_session))
        .route("/sessions/:session_id/close", post(handlers::close_session))
        .route("/sessions/:session_id/frames", post(handlers::push_frame))
        // Session queries
        .route("/sessions/:session_id/status", get(handlers::session_status))
        .route("/sessions/:session_id/results", get(handlers::session_results))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
