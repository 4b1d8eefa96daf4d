//! Run reports
//!
//! A run report is what callers get back from the runner: overall status,
//! the output value (for successful runs), per-node execution records, and
//! - for paused runs - the pending-interaction descriptor plus the
//! checkpoint id to resume from. A PAUSED run is not an error.

use crate::error::SpiceError;
use crate::message::Message;
use crate::node::PendingInteraction;
use crate::value::Value;

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
    /// Waiting on a human interaction; resume with the checkpoint id
    Paused,
    Cancelled,
}

/// Outcome of one node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Success,
    Failed,
    /// Middleware turned a failure into a no-op
    Skipped,
    /// The node paused the run
    Waiting,
}

/// Record of one node execution within a run
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node_id: String,
    pub status: NodeStatus,
    /// Attempts consumed, including the successful one
    pub attempts: u32,
    pub duration_ms: u64,
    /// Node output surfaced in the report (tool results, selector values)
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Result of [`GraphRunner::run`](crate::runner::GraphRunner::run) /
/// [`resume`](crate::runner::GraphRunner::resume)
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    /// Output-node selector value, present on success
    pub result: Option<Value>,
    /// Per-node records in execution order; partial on failure
    pub node_reports: Vec<NodeReport>,
    pub pending_interaction: Option<PendingInteraction>,
    /// Checkpoint to resume from (paused runs)
    pub checkpoint_id: Option<String>,
    /// Final message snapshot
    pub message: Option<Message>,
    /// Structured error for failed runs
    pub error: Option<SpiceError>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn is_paused(&self) -> bool {
        self.status == RunStatus::Paused
    }

    /// Report for the node, if it executed
    pub fn node_report(&self, node_id: &str) -> Option<&NodeReport> {
        self.node_reports.iter().find(|r| r.node_id == node_id)
    }
}
