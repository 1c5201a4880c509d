//! Client configuration

use crate::error::{ClientError, Result};
use diver_common::ipc::DEFAULT_DIVER_PORT;
use diver_common::ProcessId;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Diver host
    #[serde(default = "default_diver_host")]
    pub diver_host: String,
    /// Diver TCP port
    #[serde(default = "default_diver_port")]
    pub diver_port: u16,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Session key sent on `register`; defaults to this process's id
    #[serde(default)]
    pub pid: Option<ProcessId>,
    /// Local address the callback listener binds to
    #[serde(default = "default_callback_bind")]
    pub callback_bind: String,
    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Heartbeat configuration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// Retry configuration for connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Enable heartbeats
    #[serde(default = "default_heartbeat_enabled")]
    pub enabled: bool,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Heartbeat timeout in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before the connection is marked disconnected
    #[serde(default = "default_heartbeat_max_failures")]
    pub max_failures: u32,
}

fn default_diver_host() -> String {
    "127.0.0.1".to_string()
}

fn default_diver_port() -> u16 {
    DEFAULT_DIVER_PORT
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_callback_bind() -> String {
    "127.0.0.1:0".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_heartbeat_enabled() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_timeout_ms() -> u64 {
    3000
}

fn default_heartbeat_max_failures() -> u32 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            diver_host: default_diver_host(),
            diver_port: default_diver_port(),
            timeout_ms: default_timeout_ms(),
            pid: None,
            callback_bind: default_callback_bind(),
            retry: RetryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay after `current`, capped at `max_backoff_ms`
    pub fn next_backoff(&self, current: u64) -> u64 {
        ((current as f64 * self.backoff_multiplier) as u64).min(self.max_backoff_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_heartbeat_enabled(),
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
            max_failures: default_heartbeat_max_failures(),
        }
    }
}

impl ClientConfig {
    /// Config for a diver on `port`
    pub fn with_port(port: u16) -> Self {
        Self {
            diver_port: port,
            ..Default::default()
        }
    }

    pub fn with_pid(mut self, pid: ProcessId) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ClientError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ClientError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn diver_address(&self) -> String {
        format!("{}:{}", self.diver_host, self.diver_port)
    }

    pub fn session_pid(&self) -> ProcessId {
        self.pid.unwrap_or_else(std::process::id)
    }
}
