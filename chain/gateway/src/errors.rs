//! Chain-boundary error types
//!
//! `ClientError` is what the typed chain client reports. `GatewayError` is
//! what the gateway hands to the pipeline and reconciler: connectivity
//! problems are retryable, contract reverts are terminal and carry a stable
//! reason.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the underlying chain client library
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Execution reverted: {0}")]
    Revert(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Contract revert, normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    MissingRole,
    Paused,
    Blacklisted,
    InsufficientBalance,
    InvalidBatch,
    OutOfGas,
    Other(String),
}

impl RevertReason {
    /// Classify raw revert text from the network.
    pub fn from_raw(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("accesscontrol") || lower.contains("missing role") {
            RevertReason::MissingRole
        } else if lower.contains("pause") {
            RevertReason::Paused
        } else if lower.contains("blacklist") {
            RevertReason::Blacklisted
        } else if lower.contains("insufficient balance") || lower.contains("insufficientbalance") {
            RevertReason::InsufficientBalance
        } else if lower.contains("invalidbatch") || lower.contains("invalid batch") {
            RevertReason::InvalidBatch
        } else if lower.contains("out of gas") {
            RevertReason::OutOfGas
        } else {
            RevertReason::Other(raw.to_string())
        }
    }

    /// Stable reason string recorded on failed withdrawals.
    pub fn as_str(&self) -> &str {
        match self {
            RevertReason::MissingRole => "missing role",
            RevertReason::Paused => "contract paused",
            RevertReason::Blacklisted => "blacklisted",
            RevertReason::InsufficientBalance => "insufficient balance",
            RevertReason::InvalidBatch => "invalid batch",
            RevertReason::OutOfGas => "out of gas",
            RevertReason::Other(raw) => raw,
        }
    }
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("No signing key configured; {operation} is disabled")]
    MissingSigner { operation: &'static str },

    #[error("Offset {offset} out of range for {count} batches")]
    InvalidPagination { offset: u64, limit: u64, count: u64 },

    #[error("Transient chain error: {0}")]
    Transient(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Contract reverted: {0}")]
    Reverted(RevertReason),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Timeout { .. })
    }

    /// Stable reason string for terminal failures.
    pub fn reason(&self) -> String {
        match self {
            GatewayError::Reverted(reason) => reason.as_str().to_string(),
            other => other.to_string(),
        }
    }
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Transport(detail) => GatewayError::Transient(detail),
            ClientError::Timeout => GatewayError::Transient("client timeout".into()),
            ClientError::Revert(raw) => GatewayError::Reverted(RevertReason::from_raw(&raw)),
            ClientError::NotFound(what) => GatewayError::NotFound(what),
        }
    }
}
