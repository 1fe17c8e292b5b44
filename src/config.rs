use crate::frame::DEFAULT_LATE_TOLERANCE;
use crate::pipeline::RetryPolicy;
use crate::session::SessionConfig;
use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

/// Service configuration, loaded from a file with `RBM_STREAM__*` overrides
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "rbm-stream".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub nats_url: String,
    pub subject_prefix: String,
    pub handshake_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            subject_prefix: "rbm".to_string(),
            handshake_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8750,
        }
    }
}

/// Defaults applied to sessions started without explicit parameters
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub sample_rate_hz: u32,
    pub frame_len: u32,
    pub hop_len: u32,
    pub channels: u32,
    pub normalize: bool,
    pub sample_format: crate::frame::SampleFormat,
    pub auth_token: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        let config = SessionConfig::default();
        Self {
            sample_rate_hz: config.sample_rate_hz,
            frame_len: config.frame_len,
            hop_len: config.hop_len,
            channels: config.channels,
            normalize: config.normalize,
            sample_format: config.sample_format,
            auth_token: config.auth_token,
        }
    }
}

impl SessionDefaults {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            sample_rate_hz: self.sample_rate_hz,
            frame_len: self.frame_len,
            hop_len: self.hop_len,
            channels: self.channels,
            normalize: self.normalize,
            sample_format: self.sample_format,
            auth_token: self.auth_token.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Overrides the ~200ms-of-audio default when set
    pub queue_capacity: Option<usize>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub send_timeout_ms: u64,
    pub flush_grace_ms: u64,
    pub result_grace_ms: u64,
    pub gap_timeout_ms: u64,
    pub late_tolerance: f64,
    pub result_window: usize,
    pub event_capacity: usize,
    /// Retired sessions whose final stats stay queryable
    pub retired_history: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            queue_capacity: None,
            max_attempts: retry.max_attempts,
            initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            max_backoff_ms: retry.max_backoff.as_millis() as u64,
            send_timeout_ms: 1000,
            flush_grace_ms: 2000,
            result_grace_ms: 2000,
            gap_timeout_ms: 1000,
            late_tolerance: DEFAULT_LATE_TOLERANCE,
            result_window: 512,
            event_capacity: 1024,
            retired_history: 1024,
        }
    }
}

/// Runtime settings shared by every session a manager creates
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub queue_capacity: Option<usize>,
    pub retry: RetryPolicy,
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
    pub flush_grace: Duration,
    pub result_grace: Duration,
    pub gap_timeout: Duration,
    pub late_tolerance: f64,
    pub result_window: usize,
    pub event_capacity: usize,
    pub retired_history: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default(), &TransportConfig::default())
    }
}

impl StreamSettings {
    pub fn from_config(pipeline: &PipelineConfig, transport: &TransportConfig) -> Self {
        Self {
            queue_capacity: pipeline.queue_capacity,
            retry: RetryPolicy {
                max_attempts: pipeline.max_attempts.max(1),
                initial_backoff: Duration::from_millis(pipeline.initial_backoff_ms),
                max_backoff: Duration::from_millis(pipeline.max_backoff_ms),
            },
            send_timeout: Duration::from_millis(pipeline.send_timeout_ms),
            handshake_timeout: Duration::from_millis(transport.handshake_timeout_ms),
            flush_grace: Duration::from_millis(pipeline.flush_grace_ms),
            result_grace: Duration::from_millis(pipeline.result_grace_ms),
            gap_timeout: Duration::from_millis(pipeline.gap_timeout_ms),
            late_tolerance: pipeline.late_tolerance,
            result_window: pipeline.result_window.max(1),
            event_capacity: pipeline.event_capacity.max(1),
            retired_history: pipeline.retired_history.max(1),
        }
    }

    /// Queue capacity for a session: explicit override or ~200ms of hops.
    pub fn capacity_for(&self, config: &SessionConfig) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| config.default_queue_capacity())
            .max(1)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("RBM_STREAM").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings::from_config(&self.pipeline, &self.transport)
    }
}
