//! Error types for the diver

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Target error: {message}")]
    Target {
        message: String,
        stack_trace: Option<String>,
    },

    #[error("Stale reference at {address:#x} (expected {type_name})")]
    StaleReference { address: u64, type_name: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level classification of an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    Target,
    StaleReference,
    Session,
    Transport,
    NotFound,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Target => "target",
            ErrorKind::StaleReference => "stale_reference",
            ErrorKind::Session => "session",
            ErrorKind::Transport => "transport",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn target(message: impl Into<String>) -> Self {
        Error::Target {
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Error::Session(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub fn stale(address: u64, type_name: impl Into<String>) -> Self {
        Error::StaleReference {
            address,
            type_name: type_name.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Protocol(_) | Error::Serialization(_) => ErrorKind::Protocol,
            Error::Target { .. } => ErrorKind::Target,
            Error::StaleReference { .. } => ErrorKind::StaleReference,
            Error::Session(_) => ErrorKind::Session,
            Error::Transport(_) => ErrorKind::Transport,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Config(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stack trace relayed from the target, if any
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Error::Target { stack_trace, .. } => stack_trace.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
