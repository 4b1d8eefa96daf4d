//! Error types for checkpoint and idempotency storage

use thiserror::Error;

/// Convenience result type using [`CheckpointError`]
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors produced by checkpoint and idempotency stores
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The requested checkpoint does not exist (or has expired)
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// The request was malformed (missing run id, bad state string, ...)
    #[error("Invalid checkpoint request: {0}")]
    Invalid(String),

    /// Snapshot (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific storage failure
    #[error("Storage error: {0}")]
    Storage(String),
}
