//! Extensible checkpoint storage trait for custom backend implementations
//!
//! [`CheckpointStore`] is the abstraction the graph runner persists run state
//! through. The in-memory implementation in [`crate::memory`] is the
//! reference; database- or Redis-backed stores implement the same trait.
//!
//! Implementations must be `Send + Sync` and safe for concurrent access;
//! each `run_id` owns an independent checkpoint slot.

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend for run checkpoints
///
/// Checkpoints are keyed by `run_id`; storing a checkpoint for an existing
/// run replaces the previous snapshot (a run has at most one live
/// checkpoint). Stores also index by `(graph_id, execution_state)` so
/// callers can list runs waiting on human input.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any previous snapshot for the run
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Load the checkpoint for a run
    ///
    /// Returns `None` when no checkpoint exists or the stored one has
    /// expired.
    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>>;

    /// List unexpired checkpoints for a graph in the given execution state
    ///
    /// Used by HITL tooling to enumerate runs waiting on a response.
    async fn list_by_state(&self, graph_id: &str, execution_state: &str)
        -> Result<Vec<Checkpoint>>;

    /// Delete the checkpoint for a run, if present
    async fn delete(&self, run_id: &str) -> Result<()>;
}
