//! Error types for diver-client

use diver_common::ipc::ResponseEnvelope;
use diver_common::{ErrorKind, ObjectAddress};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the diver, or the connection dropped
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Not connected to diver")]
    NotConnected,

    /// The diver answered with an error response
    #[error("Diver error [{kind}]: {message}")]
    Remote {
        kind: ErrorKind,
        message: String,
        stack_trace: Option<String>,
        /// Object a stale reference pointed at
        object: Option<ObjectAddress>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy used in a way its path cannot express
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Rebuild the error carried by a diver response
    pub fn from_response(response: &ResponseEnvelope) -> Self {
        ClientError::Remote {
            kind: response.error_kind.unwrap_or(ErrorKind::Internal),
            message: response
                .error_message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
            stack_trace: response.error_stack_trace.clone(),
            object: response.error_object.clone(),
        }
    }

    /// Wire kind of a remote error
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_stale_reference(&self) -> bool {
        self.kind() == Some(ErrorKind::StaleReference)
    }

    /// Stack trace of an exception thrown inside the target
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            ClientError::Remote { stack_trace, .. } => stack_trace.as_deref(),
            _ => None,
        }
    }

    /// Last known address and expected type behind a stale reference
    pub fn stale_object(&self) -> Option<&ObjectAddress> {
        match self {
            ClientError::Remote { object, .. } => object.as_ref(),
            _ => None,
        }
    }

    /// Errors after which the connection should be considered lost
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::NotConnected | ClientError::Io(_)
        )
    }
}

impl From<diver_common::Error> for ClientError {
    fn from(err: diver_common::Error) -> Self {
        match err {
            diver_common::Error::Transport(msg) => ClientError::Connection(msg),
            diver_common::Error::Protocol(msg) | diver_common::Error::Serialization(msg) => {
                ClientError::Protocol(msg)
            }
            diver_common::Error::Config(msg) => ClientError::Config(msg),
            other => ClientError::Remote {
                kind: other.kind(),
                stack_trace: other.stack_trace().map(str::to_string),
                object: match &other {
                    diver_common::Error::StaleReference { address, type_name } => {
                        Some(ObjectAddress::new(*address, type_name.clone()))
                    }
                    _ => None,
                },
                message: other.to_string(),
            },
        }
    }
}
