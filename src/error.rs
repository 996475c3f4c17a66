//! Error types for the QuerySync engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the synchronization engine.
///
/// Cloneable because a single fetch failure is delivered to every caller
/// waiting on the same inflight request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // =========================================================================
    // Fetch / Transport Errors
    // =========================================================================
    /// Network failure that is worth retrying
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Request timed out
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Input rejected by the authoritative source, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic update rejected by the authoritative source
    #[error("Mutation conflict: {0}")]
    MutationConflict(String),

    /// Resource does not exist at the source
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cache-only read of a key with no entry
    #[error("No cached entry for key: {0}")]
    CacheMiss(String),

    /// Caller stopped waiting on a read
    #[error("Read cancelled for key: {0}")]
    Cancelled(String),

    /// Push transport failure
    #[error("Push transport error: {0}")]
    Transport(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Entry options violate evictAfter >= staleAfter
    #[error("Invalid cache options: {0}")]
    InvalidOptions(String),

    /// Invalidation pattern could not be compiled
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Push update strategy does not fit the cached data shape
    #[error("Cannot apply {strategy} update to {key}: {reason}")]
    UpdateMismatch {
        key: String,
        strategy: String,
        reason: String,
    },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry may succeed (network failures and timeouts).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_) | Error::Timeout(_))
    }

    /// Whether this is a definitive miss at the source.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {}", e))
    }
}
