// HTTP control API driven in-process with tower's oneshot

mod common;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use rbm_stream::{create_router, AppState, SessionConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    let (manager, _transport) = manager();
    let defaults = SessionConfig {
        auth_token: TOKEN.to_string(),
        ..SessionConfig::default()
    };
    create_router(AppState::new(manager, defaults))
}

async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Ok((status, body))
}

fn post_json(uri: &str, body: Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?)
}

fn post_bytes(uri: &str, body: Vec<u8>) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/octet-stream")
        .body(Body::from(body))?)
}

fn get(uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder().uri(uri).body(Body::empty())?)
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let app = app();
    let response = app.oneshot(get("/health")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_session_round_trip() -> Result<()> {
    let app = app();

    let (status, body) = send(&app, post_json("/sessions", json!({}))?).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "active");
    let id = body["session_id"].as_str().unwrap().to_string();

    for expected in 0..3 {
        let (status, body) =
            send(&app, post_bytes(&format!("/sessions/{id}/frames"), pcm8_frame(40))?).await?;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["sequence"], expected);
    }

    let (status, body) = send(&app, get(&format!("/sessions/{id}/status"))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["frames_accepted"], 3);

    let (status, body) = send(&app, post_json(&format!("/sessions/{id}/close"), json!({}))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "closed");
    assert_eq!(body["frames_sent"], 3);

    let mut delivered = 0;
    for _ in 0..100 {
        let (_, body) = send(&app, get(&format!("/sessions/{id}/results"))?).await?;
        if body["terminal"].is_string() {
            delivered = body["delivered"].as_u64().unwrap_or(0);
            assert_eq!(body["recent"].as_array().map(|r| r.len()), Some(3));
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(delivered, 3);

    let (status, _) =
        send(&app, post_bytes(&format!("/sessions/{id}/frames"), pcm8_frame(40))?).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn test_rejected_credential_is_unauthorized() -> Result<()> {
    let app = app();
    let (status, body) = send(&app, post_json("/sessions", json!({"auth_token": "nope"}))?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("invalid auth token"));
    Ok(())
}

#[tokio::test]
async fn test_invalid_session_parameters_are_bad_request() -> Result<()> {
    let app = app();
    let (status, _) = send(&app, post_json("/sessions", json!({"sample_rate_hz": 0}))?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json("/sessions", json!({"wav_path": "/nonexistent/audio.wav"}))?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_wrong_frame_size_is_bad_request() -> Result<()> {
    let app = app();
    let (_, body) = send(&app, post_json("/sessions", json!({}))?).await?;
    let id = body["session_id"].as_str().unwrap().to_string();

    let (status, body) =
        send(&app, post_bytes(&format!("/sessions/{id}/frames"), vec![128; 10])?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("expected 256"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_session_is_not_found() -> Result<()> {
    let app = app();
    let (status, _) = send(&app, get("/sessions/missing/status")?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, get("/sessions/missing/results")?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, post_json("/sessions/missing/close", json!({}))?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

async fn wait_for_terminal(app: &Router, id: &str) -> Result<()> {
    for _ in 0..200 {
        let (_, body) = send(app, get(&format!("/sessions/{id}/results"))?).await?;
        if body["terminal"].is_string() {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    anyhow::bail!("session {id} never reached a terminal event")
}

#[tokio::test]
async fn test_ended_result_logs_are_evicted() -> Result<()> {
    let (manager, _transport) = manager();
    let defaults = SessionConfig {
        auth_token: TOKEN.to_string(),
        ..SessionConfig::default()
    };
    let mut state = AppState::new(manager, defaults);
    state.finished_history = 1;
    let app = create_router(state);

    let mut ids = Vec::new();
    for _ in 0..2 {
        let (status, body) = send(&app, post_json("/sessions", json!({}))?).await?;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["session_id"].as_str().unwrap().to_string();
        let (status, _) =
            send(&app, post_json(&format!("/sessions/{id}/close"), json!({}))?).await?;
        assert_eq!(status, StatusCode::OK);
        wait_for_terminal(&app, &id).await?;
        ids.push(id);
    }

    let (status, _) = send(&app, get(&format!("/sessions/{}/results", ids[0]))?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = send(&app, get(&format!("/sessions/{}/results", ids[1]))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["terminal"].is_string());

    // Session status outlives the result log.
    let (status, body) = send(&app, get(&format!("/sessions/{}/status", ids[0]))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "closed");
    Ok(())
}
