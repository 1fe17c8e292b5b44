// Shared helpers for the integration tests
#![allow(dead_code)]

use rbm_stream::{
    LoopbackOptions, LoopbackTransport, SessionConfig, SessionEvent, SessionManager,
    StreamSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const TOKEN: &str = "secret123";

/// Typical capture settings: 16kHz mono, 256-sample PCM8 frames
pub fn session_config() -> SessionConfig {
    SessionConfig {
        sample_rate_hz: 16000,
        frame_len: 256,
        hop_len: 256,
        channels: 1,
        normalize: true,
        auth_token: TOKEN.to_string(),
        ..SessionConfig::default()
    }
}

pub fn settings() -> StreamSettings {
    StreamSettings {
        queue_capacity: Some(256),
        ..StreamSettings::default()
    }
}

pub fn loopback(options: LoopbackOptions) -> Arc<LoopbackTransport> {
    Arc::new(LoopbackTransport::new(options))
}

pub fn manager_with(
    options: LoopbackOptions,
    settings: StreamSettings,
) -> (SessionManager, Arc<LoopbackTransport>) {
    let transport = loopback(options);
    let manager = SessionManager::new(transport.clone(), settings);
    (manager, transport)
}

pub fn manager() -> (SessionManager, Arc<LoopbackTransport>) {
    manager_with(LoopbackOptions::default(), settings())
}

/// One 256-byte PCM8 frame: a square wave of the given amplitude
pub fn pcm8_frame(amplitude: u8) -> Vec<u8> {
    (0..256)
        .map(|i| {
            if (i / 8) % 2 == 0 {
                128u8.saturating_add(amplitude)
            } else {
                128u8.saturating_sub(amplitude)
            }
        })
        .collect()
}

/// Poll `condition` until it holds; panics after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event stream ended")
}

/// Collect events up to and including the terminal one.
pub async fn drain_events(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    loop {
        let event = next_event(events).await;
        let terminal = event.is_terminal();
        collected.push(event);
        if terminal {
            return collected;
        }
    }
}

pub fn result_sequences(events: &[SessionEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Result(result) => Some(result.sequence),
            _ => None,
        })
        .collect()
}
