//! Domain error kinds.
//!
//! Hand-rolled `Display`/`Error` impls rather than reaching for
//! `thiserror`, matching the rest of this crate's error style.

use std::fmt;

/// Fatal at startup: malformed or missing configuration.
#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}
impl std::error::Error for ConfigError {}

/// Retriable failure talking to an off-chain HTTP source.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub source_name: String,
    pub reason: String,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream error from {}: {}", self.source_name, self.reason)
    }
}
impl std::error::Error for UpstreamError {}

/// Chain/bridge RPC failure, categorized into retriable vs terminal.
#[derive(Debug, Clone)]
pub struct ChainError {
    pub reason: String,
    pub retriable: bool,
}

impl ChainError {
    pub fn retriable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retriable: true,
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retriable: false,
        }
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain error ({}): {}",
            if self.retriable { "retriable" } else { "terminal" },
            self.reason
        )
    }
}
impl std::error::Error for ChainError {}

/// No decision could be reached this cycle; callers treat this as `hold`.
#[derive(Debug, Clone)]
pub struct ConsensusError(pub String);

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consensus error: {}", self.0)
    }
}
impl std::error::Error for ConsensusError {}

/// Invalid state transition attempted on a `CrossChainMessage`. Fatal for
/// that message, not for the orchestrator.
#[derive(Debug, Clone)]
pub struct StateError {
    pub message_id: String,
    pub reason: String,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid state transition for message {}: {}",
            self.message_id, self.reason
        )
    }
}
impl std::error::Error for StateError {}

/// Caller cancelled an in-flight operation.
#[derive(Debug, Clone, Default)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}
impl std::error::Error for CancelledError {}
