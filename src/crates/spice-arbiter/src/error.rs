//! Error types for the arbiter

use thiserror::Error;

/// Convenience result type using [`ArbiterError`]
pub type Result<T> = std::result::Result<T, ArbiterError>;

/// Errors produced while consuming and routing human responses
#[derive(Error, Debug)]
pub enum ArbiterError {
    /// Response queue backend failure
    #[error("Response queue error: {0}")]
    Queue(String),

    /// No WAITING checkpoint matches the response
    #[error("No waiting run matches response for run '{run_id}' node '{node_id}'")]
    NoMatchingCheckpoint { run_id: String, node_id: String },

    /// The response does not match the pending interaction
    #[error("Response correlation failed: {0}")]
    Correlation(String),

    /// The provider knows no graph with this id
    #[error("No graph registered for id '{0}'")]
    UnknownGraph(String),

    /// Underlying runtime failure
    #[error(transparent)]
    Runtime(#[from] spice_core::SpiceError),

    /// Checkpoint storage failure
    #[error(transparent)]
    Checkpoint(#[from] spice_checkpoint::CheckpointError),
}
