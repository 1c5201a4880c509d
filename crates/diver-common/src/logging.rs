//! Logging setup shared by the diver and its controllers
//!
//! The diver runs inside someone else's process, so by default it logs to a
//! per-pid file next to the target instead of the target's console.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Open log file shared by every writer handed to the subscriber
static LOG_FILE: Mutex<Option<(PathBuf, File)>> = Mutex::new(None);

/// Logging section of the diver/client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log to stderr
    #[serde(default = "default_true")]
    pub console_enabled: bool,

    /// Log to `file_path`
    #[serde(default)]
    pub file_enabled: bool,

    #[serde(default = "default_log_path")]
    pub file_path: String,

    /// Include file/line info
    #[serde(default)]
    pub file_info: bool,

    #[serde(default = "default_true")]
    pub show_target: bool,

    #[serde(default = "default_true")]
    pub ansi_colors: bool,

    /// Level or full `EnvFilter` directive (`info`, `diver_agent=debug`)
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "diver.log".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: default_log_path(),
            file_info: false,
            show_target: true,
            ansi_colors: true,
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            file_info: true,
            ..Default::default()
        }
    }

    /// File-only logging, for use inside a target process
    pub fn in_target(path: impl Into<String>) -> Self {
        Self {
            console_enabled: false,
            file_enabled: true,
            file_path: path.into(),
            ansi_colors: false,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.file_enabled = true;
        self.file_path = path.to_string();
        self
    }

    /// Parse the leading level of `level` into a tracing `Level`
    pub fn get_level(&self) -> Level {
        let head = self.level.split(',').next().unwrap_or("info");
        match head.trim().to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn file_writer() -> Box<dyn Write + Send> {
    if let Ok(guard) = LOG_FILE.lock() {
        if let Some((_, ref file)) = *guard {
            if let Ok(f) = file.try_clone() {
                return Box::new(f);
            }
        }
    }
    Box::new(std::io::sink())
}

/// Initialize the global subscriber. Only the first call takes effect.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut file_ready = false;
    if config.file_enabled && !config.file_path.is_empty() {
        if let Ok(file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file_path)
        {
            if let Ok(mut guard) = LOG_FILE.lock() {
                *guard = Some((PathBuf::from(&config.file_path), file));
                file_ready = true;
            }
        }
    }

    let console_layer = config.console_enabled.then(|| {
        fmt::layer()
            .with_ansi(config.ansi_colors)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(std::io::stderr)
    });

    let file_layer = file_ready.then(|| {
        fmt::layer()
            .with_ansi(false)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(file_writer)
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize logging for a diver running inside a target.
///
/// Writes `{cwd}/diver-{pid}.log` so several targets on one machine do not
/// share a file.
pub fn init_agent_logging(level: &str) {
    let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    path.push(format!("diver-{}.log", std::process::id()));
    let config = LogConfig::in_target(path.to_string_lossy()).with_level(level);
    init_logging(&config);
}

/// Path of the active log file, if file logging was set up
pub fn log_file_path() -> Option<PathBuf> {
    LOG_FILE
        .lock()
        .ok()
        .and_then(|guard| guard.as_ref().map(|(path, _)| path.clone()))
}
