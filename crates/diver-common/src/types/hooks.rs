//! Hook and subscription types

use serde::{Deserialize, Serialize};

/// When, relative to the original call, a hook captures its context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPosition {
    /// Before the original body runs; sees instance and arguments
    Pre,
    /// After a normal return; also sees the return value
    Post,
    /// After the call however it ended; sees the return value or the error
    Finalizer,
}

impl std::fmt::Display for HookPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookPosition::Pre => write!(f, "pre"),
            HookPosition::Post => write!(f, "post"),
            HookPosition::Finalizer => write!(f, "finalizer"),
        }
    }
}

impl std::str::FromStr for HookPosition {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pre" | "prefix" => Ok(HookPosition::Pre),
            "post" | "postfix" => Ok(HookPosition::Post),
            "finalizer" | "finally" => Ok(HookPosition::Finalizer),
            other => Err(crate::Error::protocol(format!(
                "Unknown hook position: {}",
                other
            ))),
        }
    }
}

/// Lifecycle of a hook or event token.
///
/// `Unregistered` is terminal; a token never returns to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Registered,
    Active,
    Unregistered,
}

impl TokenState {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: TokenState) -> bool {
        matches!(
            (self, next),
            (TokenState::Registered, TokenState::Active)
                | (TokenState::Registered, TokenState::Unregistered)
                | (TokenState::Active, TokenState::Unregistered)
        )
    }
}
