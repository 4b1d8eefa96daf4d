//! Checkpoint data structure
//!
//! A checkpoint is a point-in-time snapshot of one workflow run, taken at a
//! node boundary. It carries everything needed to resume the run later: the
//! message snapshot (as plain JSON, so this crate stays independent of the
//! runtime's message type), the execution state, and - for runs paused on a
//! human interaction - the pending-interaction descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted snapshot of a workflow run at a node boundary
///
/// Checkpoints are keyed by `run_id`. Subgraph pauses use a namespaced key
/// (`"{parent_run_id}:subgraph:{child_id}"`) so parent and child snapshots
/// never collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run this checkpoint belongs to (the storage key)
    pub run_id: String,
    /// Graph the run executes
    pub graph_id: String,
    /// Parent run id when this run is a subgraph child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// The paused or last-completed node
    pub node_id: String,
    /// JSON snapshot of the run's message
    pub message: serde_json::Value,
    /// Execution state at snapshot time (e.g. "WAITING", "FAILED")
    pub execution_state: String,
    /// Pending human interaction, present only for WAITING snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interaction: Option<serde_json::Value>,
    /// Hard expiry; a checkpoint past this instant loads as absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Snapshot creation time
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint for the given run at the given node
    pub fn new(
        run_id: impl Into<String>,
        graph_id: impl Into<String>,
        node_id: impl Into<String>,
        message: serde_json::Value,
        execution_state: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            graph_id: graph_id.into(),
            parent_run_id: None,
            node_id: node_id.into(),
            message,
            execution_state: execution_state.into(),
            pending_interaction: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    /// Attach a parent run id (subgraph child checkpoints)
    pub fn with_parent_run_id(mut self, parent: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent.into());
        self
    }

    /// Attach the pending-interaction descriptor
    pub fn with_pending_interaction(mut self, interaction: serde_json::Value) -> Self {
        self.pending_interaction = Some(interaction);
        self
    }

    /// Set a hard expiry instant
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the checkpoint has passed its expiry
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Utc::now()).unwrap_or(false)
    }
}
