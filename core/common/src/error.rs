//! Common error types for DocVault.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for DocVault sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A unit of work failed in a way that may succeed on a later attempt.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// An operation failed on every allowed attempt.
    #[error("Operation '{name}' exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        name: String,
        attempts: u32,
        /// Failure of the final attempt.
        #[source]
        source: Box<Error>,
    },

    /// A sync phase failed and aborted the pass.
    #[error("Sync phase '{phase}' failed: {source}")]
    SyncPhase {
        phase: String,
        #[source]
        source: Box<Error>,
    },

    /// No persistence collaborator has been configured.
    #[error("Persistence unavailable: no store configured")]
    PersistenceUnavailable,

    /// A unit of work did not finish before its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Background scheduler is not reachable.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
