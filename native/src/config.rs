// Relay configuration: defaults, optional JSON file, then environment overrides.

use crate::broadcast::{DEFAULT_PUSH_PORT, DEFAULT_SUBSCRIBER_QUEUE};
use crate::buffer::DEFAULT_CAPACITY;
use crate::channel::DEFAULT_CHANNEL_NAME;
use crate::ingest::{IngestOptions, UnmatchedPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Verbosity the monitored SDK is asked to log at.
pub const DEFAULT_SDK_LOG_LEVEL: u8 = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub channel_name: String,
    /// Explicit channel location; overrides the private default.
    pub channel_path: Option<PathBuf>,
    pub buffer_capacity: usize,
    pub unmatched: UnmatchedPolicy,
    pub push_enabled: bool,
    pub push_bind: SocketAddr,
    pub push_intensity: bool,
    pub subscriber_queue: usize,
    pub sdk_log_level: u8,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            channel_path: None,
            buffer_capacity: DEFAULT_CAPACITY,
            unmatched: UnmatchedPolicy::RecordNull,
            push_enabled: true,
            push_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PUSH_PORT)),
            push_intensity: false,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            sdk_log_level: DEFAULT_SDK_LOG_LEVEL,
            retry_initial_ms: 250,
            retry_max_ms: 5_000,
            stop_timeout_ms: 2_000,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Defaults overridden by `RELAY_*` process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Apply `RELAY_*` process environment variables on top of `self`.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("RELAY_CHANNEL_NAME") {
            self.channel_name = value;
        }
        if let Some(value) = lookup("RELAY_CHANNEL_PATH") {
            self.channel_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("RELAY_BUFFER_CAPACITY") {
            self.buffer_capacity = parse_value("RELAY_BUFFER_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("RELAY_RECORD_UNMATCHED") {
            self.unmatched = if parse_flag("RELAY_RECORD_UNMATCHED", &value)? {
                UnmatchedPolicy::RecordNull
            } else {
                UnmatchedPolicy::Skip
            };
        }
        if let Some(value) = lookup("RELAY_PUSH_ENABLED") {
            self.push_enabled = parse_flag("RELAY_PUSH_ENABLED", &value)?;
        }
        if let Some(value) = lookup("RELAY_PUSH_BIND") {
            self.push_bind = parse_value("RELAY_PUSH_BIND", &value)?;
        }
        if let Some(value) = lookup("RELAY_PUSH_INTENSITY") {
            self.push_intensity = parse_flag("RELAY_PUSH_INTENSITY", &value)?;
        }
        if let Some(value) = lookup("RELAY_SUBSCRIBER_QUEUE") {
            self.subscriber_queue = parse_value("RELAY_SUBSCRIBER_QUEUE", &value)?;
        }
        if let Some(value) = lookup("RELAY_SDK_LOG_LEVEL") {
            self.sdk_log_level = parse_value("RELAY_SDK_LOG_LEVEL", &value)?;
        }
        if let Some(value) = lookup("RELAY_RETRY_INITIAL_MS") {
            self.retry_initial_ms = parse_value("RELAY_RETRY_INITIAL_MS", &value)?;
        }
        if let Some(value) = lookup("RELAY_RETRY_MAX_MS") {
            self.retry_max_ms = parse_value("RELAY_RETRY_MAX_MS", &value)?;
        }
        if let Some(value) = lookup("RELAY_STOP_TIMEOUT_MS") {
            self.stop_timeout_ms = parse_value("RELAY_STOP_TIMEOUT_MS", &value)?;
        }

        Ok(self)
    }

    pub fn ingest_options(&self) -> IngestOptions {
        let retry_initial = Duration::from_millis(self.retry_initial_ms.max(1));
        IngestOptions {
            unmatched: self.unmatched,
            retry_initial,
            retry_max: Duration::from_millis(self.retry_max_ms).max(retry_initial),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
