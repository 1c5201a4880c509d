//! Diver Common Types
//!
//! Shared types and wire protocol definitions used by the diver and its controllers.

pub mod error;
pub mod ipc;
pub mod logging;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use logging::{init_agent_logging, init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};

/// Crate version reported by `status`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
