//! Diver configuration
//!
//! Loaded from TOML, or assembled from the string argument the bootstrap
//! loader passes to [`entry_point`](crate::entry_point).

use crate::session::DuplicateSessionPolicy;
use diver_common::ipc::DEFAULT_DIVER_PORT;
use diver_common::{Error, LogConfig, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiverConfig {
    /// TCP port to listen on; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Connections beyond this are closed on accept
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Upper bound for one handler, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Pending hook/event pushes before new ones are dropped
    #[serde(default = "default_callback_queue_capacity")]
    pub callback_queue_capacity: usize,
    /// Connect and write timeout for callback endpoints, in milliseconds
    #[serde(default = "default_callback_send_timeout_ms")]
    pub callback_send_timeout_ms: u64,
    #[serde(default)]
    pub duplicate_session_policy: DuplicateSessionPolicy,
    /// Tear down sessions registered over a connection when it closes
    #[serde(default = "default_true")]
    pub teardown_on_disconnect: bool,
    /// How long in-flight requests may run after `die`, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub logging: LogConfig,
}

fn default_port() -> u16 {
    DEFAULT_DIVER_PORT
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_max_clients() -> usize {
    16
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_callback_queue_capacity() -> usize {
    1024
}

fn default_callback_send_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

impl Default for DiverConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            max_clients: default_max_clients(),
            request_timeout_ms: default_request_timeout_ms(),
            callback_queue_capacity: default_callback_queue_capacity(),
            callback_send_timeout_ms: default_callback_send_timeout_ms(),
            duplicate_session_policy: DuplicateSessionPolicy::default(),
            teardown_on_disconnect: default_true(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            logging: LogConfig::default(),
        }
    }
}

impl DiverConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Parse the loader argument: a bare port (`"9977"`) or `key=value`
    /// pairs separated by `;`. A `config` key loads that file first; the
    /// other keys override it.
    pub fn from_argument(argument: &str) -> Result<Self> {
        let argument = argument.trim();
        if argument.is_empty() {
            return Ok(Self::default());
        }
        if let Ok(port) = argument.parse::<u16>() {
            return Ok(Self::with_port(port));
        }

        let mut pairs = Vec::new();
        for part in argument.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("Expected key=value, got '{}'", part)))?;
            pairs.push((key.trim().to_lowercase(), value.trim().to_string()));
        }

        let mut config = match pairs.iter().find(|(k, _)| k == "config") {
            Some((_, path)) => Self::from_file(path)?,
            None => Self::default(),
        };
        for (key, value) in pairs {
            match key.as_str() {
                "config" => {}
                "port" => {
                    config.port = value
                        .parse()
                        .map_err(|_| Error::Config(format!("Invalid port '{}'", value)))?;
                }
                "log_level" => config.logging.level = value,
                "log_file" => config.logging = config.logging.with_file(&value),
                other => return Err(Error::Config(format!("Unknown argument key '{}'", other))),
            }
        }
        Ok(config)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn callback_send_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_send_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DiverConfig::default();
        assert_eq!(config.port, 9977);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.max_clients, 16);
        assert_eq!(config.duplicate_session_policy, DuplicateSessionPolicy::Reject);
        assert!(config.teardown_on_disconnect);
        assert_eq!(config.listen_address(), "127.0.0.1:9977");
    }

    #[test]
    fn test_from_toml() {
        let config = DiverConfig::from_toml(
            r#"
            port = 12000
            duplicate_session_policy = "supersede"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 12000);
        assert_eq!(config.duplicate_session_policy, DuplicateSessionPolicy::Supersede);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.request_timeout_ms, 30000);
    }

    #[test]
    fn test_argument_bare_port() {
        assert_eq!(DiverConfig::from_argument("4321").unwrap().port, 4321);
        assert_eq!(DiverConfig::from_argument("").unwrap(), DiverConfig::default());
    }

    #[test]
    fn test_argument_pairs() {
        let config = DiverConfig::from_argument("port=5000; log_level=trace;log_file=d.log").unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.logging.level, "trace");
        assert!(config.logging.file_enabled);
        assert_eq!(config.logging.file_path, "d.log");
    }

    #[test]
    fn test_argument_errors() {
        assert!(DiverConfig::from_argument("port=abc").is_err());
        assert!(DiverConfig::from_argument("colour=blue").is_err());
        assert!(DiverConfig::from_argument("nonsense").is_err());
        assert!(DiverConfig::from_argument("config=/nonexistent/diver.toml").is_err());
    }
}
