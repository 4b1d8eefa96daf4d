//! Per-run execution context
//!
//! Tenant/user/trace context is threaded explicitly through node
//! invocations as an immutable key/value view - never through thread-locals
//! - and is copied into spawned tasks and subgraph children. The context
//! also carries the run's cancellation token and the per-node invocation
//! counters human nodes use for loop-safe prompt ids.

use crate::error::{Result, SpiceError};
use crate::message::Message;
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Well-known context keys propagated across subgraph boundaries.
pub const KEY_TENANT_ID: &str = "tenantId";
pub const KEY_USER_ID: &str = "userId";
pub const KEY_CORRELATION_ID: &str = "correlationId";
pub const KEY_TRACE_ID: &str = "traceId";

/// Context for one run of one graph
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub graph_id: String,
    /// Subgraph nesting depth; 0 for top-level runs
    pub depth: u32,
    /// Immutable propagated key/value view (tenant, user, trace, ...)
    values: Arc<HashMap<String, String>>,
    /// Cancelling the token aborts node execution and pending retry waits
    pub cancellation: CancellationToken,
    invocations: Arc<Mutex<HashMap<String, u32>>>,
}

impl RunContext {
    /// Fresh context with a generated run id
    pub fn new(graph_id: impl Into<String>) -> Self {
        Self::with_run_id(Uuid::new_v4().to_string(), graph_id)
    }

    /// Fresh context with a caller-supplied run id
    pub fn with_run_id(run_id: impl Into<String>, graph_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            graph_id: graph_id.into(),
            depth: 0,
            values: Arc::new(HashMap::new()),
            cancellation: CancellationToken::new(),
            invocations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Capture propagated values from a message's metadata
    ///
    /// Only string-valued entries for the given keys are captured; the
    /// message's correlation id is always included.
    pub fn capture_values(mut self, message: &Message, keys: &[String]) -> Self {
        let mut values: HashMap<String, String> = keys
            .iter()
            .filter_map(|key| {
                message
                    .get_metadata(key)
                    .and_then(Value::as_str)
                    .map(|v| (key.clone(), v.to_string()))
            })
            .collect();
        values
            .entry(KEY_CORRELATION_ID.to_string())
            .or_insert_with(|| message.correlation_id.clone());
        self.values = Arc::new(values);
        self
    }

    /// Context for a subgraph child run
    ///
    /// The child shares the parent's cancellation token and propagated
    /// values but gets its own run id, graph id, and invocation counters.
    pub fn child(&self, child_run_id: impl Into<String>, child_graph_id: impl Into<String>) -> Self {
        Self {
            run_id: child_run_id.into(),
            graph_id: child_graph_id.into(),
            depth: self.depth + 1,
            values: self.values.clone(),
            cancellation: self.cancellation.clone(),
            invocations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Propagated value by key
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.value(KEY_TENANT_ID)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.value(KEY_USER_ID)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.value(KEY_TRACE_ID)
    }

    /// Current invocation index for a node (0 before the first entry)
    pub fn invocation_index(&self, node_id: &str) -> u32 {
        *self.invocations.lock().get(node_id).unwrap_or(&0)
    }

    /// Restore a node's invocation counter (used on resume from checkpoint)
    pub fn restore_invocation_index(&self, node_id: &str, index: u32) {
        self.invocations.lock().insert(node_id.to_string(), index);
    }

    /// Claim the next invocation index for a node
    ///
    /// Returns the index for this entry and bumps the counter, so a loop
    /// re-entering the node observes a fresh index while retries within one
    /// entry reuse it via [`invocation_index`](Self::invocation_index).
    pub fn next_invocation_index(&self, node_id: &str) -> u32 {
        let mut counters = self.invocations.lock();
        let entry = counters.entry(node_id.to_string()).or_insert(0);
        let current = *entry;
        *entry += 1;
        current
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Error out when the run has been cancelled
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SpiceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_values_from_metadata() {
        let msg = Message::new("x", "a")
            .with_metadata(KEY_TENANT_ID, "t-1")
            .with_metadata(KEY_USER_ID, "u-1")
            .with_metadata("unrelated", "ignored");
        let ctx = RunContext::new("g").capture_values(
            &msg,
            &[KEY_TENANT_ID.to_string(), KEY_USER_ID.to_string()],
        );

        assert_eq!(ctx.tenant_id(), Some("t-1"));
        assert_eq!(ctx.user_id(), Some("u-1"));
        assert_eq!(ctx.value("unrelated"), None);
        // Correlation id is always captured.
        assert_eq!(ctx.value(KEY_CORRELATION_ID), Some(msg.correlation_id.as_str()));
    }

    #[test]
    fn test_child_shares_cancellation_and_values() {
        let msg = Message::new("x", "a").with_metadata(KEY_TENANT_ID, "t-1");
        let parent =
            RunContext::new("g").capture_values(&msg, &[KEY_TENANT_ID.to_string()]);
        let child = parent.child("child-run", "child-graph");

        assert_eq!(child.depth, 1);
        assert_eq!(child.tenant_id(), Some("t-1"));

        parent.cancellation.cancel();
        assert!(child.is_cancelled());
        assert!(child.ensure_active().is_err());
    }

    #[test]
    fn test_invocation_counters() {
        let ctx = RunContext::new("g");
        assert_eq!(ctx.invocation_index("select"), 0);
        assert_eq!(ctx.next_invocation_index("select"), 0);
        assert_eq!(ctx.next_invocation_index("select"), 1);
        assert_eq!(ctx.invocation_index("select"), 2);
        // Counters are per node.
        assert_eq!(ctx.next_invocation_index("other"), 0);
    }
}
