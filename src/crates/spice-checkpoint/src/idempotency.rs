//! Idempotency store - at-most-once execution of side-effecting operations
//!
//! Before a node with external side effects executes, the runner computes a
//! fingerprint over `(run_id, node_id, attempt, canonicalized inputs)` and
//! records an IN_FLIGHT entry. A later attempt with the same fingerprint
//! either observes a DONE entry (and reuses the stored result without
//! re-executing) or an IN_FLIGHT entry (and backs off until it expires).
//!
//! Fingerprint stability depends on the caller canonicalizing inputs with a
//! deterministic encoder (sorted keys, normalized numerics); the store only
//! hashes what it is given.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default entry retention: 1 hour.
const DEFAULT_TTL_SECS: i64 = 60 * 60;

/// Compute the fingerprint for one attempt of one node in one run
///
/// `canonical_inputs` must be the canonical-JSON rendering of the node's
/// inputs so equal inputs always hash equally.
pub fn fingerprint(run_id: &str, node_id: &str, attempt: u32, canonical_inputs: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(node_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(attempt.to_be_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_inputs.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lifecycle of an idempotency entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyStatus {
    /// The operation is currently executing somewhere
    InFlight,
    /// The operation completed; the stored result is authoritative
    Done,
    /// The operation failed non-retryably
    Failed,
}

/// One recorded operation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub fingerprint: String,
    pub run_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub status: IdempotencyStatus,
    /// Result handle, present once `status == Done`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyEntry {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Outcome of attempting to claim a fingerprint
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// No live entry existed; the caller now owns execution
    Acquired,
    /// A prior attempt already completed; reuse its result
    Done(Option<serde_json::Value>),
    /// Another attempt is executing; re-check after a delay
    InFlight {
        /// When the in-flight claim lapses
        expires_at: DateTime<Utc>,
    },
}

/// Storage backend deduplicating side-effecting operations by fingerprint
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claim a fingerprint for execution
    ///
    /// Atomically records an IN_FLIGHT entry when no live entry exists.
    /// Expired entries (any status) are treated as absent.
    async fn begin(
        &self,
        fingerprint: &str,
        run_id: &str,
        node_id: &str,
        attempt: u32,
    ) -> Result<BeginOutcome>;

    /// Mark the fingerprint DONE and store the result handle
    async fn complete(&self, fingerprint: &str, result: serde_json::Value) -> Result<()>;

    /// Mark the fingerprint FAILED (non-retryable failure)
    async fn fail(&self, fingerprint: &str) -> Result<()>;
}

/// In-memory [`IdempotencyStore`] implementation
#[derive(Debug, Clone)]
pub struct InMemoryIdempotencyStore {
    entries: Arc<RwLock<HashMap<String, IdempotencyEntry>>>,
    ttl: Duration,
}

impl InMemoryIdempotencyStore {
    /// Create a store with the default 1-hour TTL
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_TTL_SECS))
    }

    /// Create a store with a custom entry TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Fetch an entry regardless of status (diagnostics and tests)
    pub async fn get(&self, fingerprint: &str) -> Option<IdempotencyEntry> {
        self.entries.read().await.get(fingerprint).cloned()
    }

    /// Number of live (unexpired) entries
    pub async fn live_count(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired()).count()
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(
        &self,
        fingerprint: &str,
        run_id: &str,
        node_id: &str,
        attempt: u32,
    ) -> Result<BeginOutcome> {
        let mut entries = self.entries.write().await;
        match entries.get(fingerprint) {
            Some(entry) if !entry.is_expired() => match entry.status {
                IdempotencyStatus::Done => return Ok(BeginOutcome::Done(entry.result.clone())),
                IdempotencyStatus::InFlight => {
                    return Ok(BeginOutcome::InFlight {
                        expires_at: entry.expires_at,
                    })
                }
                // A failed attempt does not block a fresh claim.
                IdempotencyStatus::Failed => {}
            },
            _ => {}
        }

        let now = Utc::now();
        entries.insert(
            fingerprint.to_string(),
            IdempotencyEntry {
                fingerprint: fingerprint.to_string(),
                run_id: run_id.to_string(),
                node_id: node_id.to_string(),
                attempt,
                status: IdempotencyStatus::InFlight,
                result: None,
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
        Ok(BeginOutcome::Acquired)
    }

    async fn complete(&self, fingerprint: &str, result: serde_json::Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(fingerprint) {
            entry.status = IdempotencyStatus::Done;
            entry.result = Some(result);
        }
        Ok(())
    }

    async fn fail(&self, fingerprint: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(fingerprint) {
            entry.status = IdempotencyStatus::Failed;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("run-1", "tool", 1, r#"{"x":1}"#);
        let b = fingerprint("run-1", "tool", 1, r#"{"x":1}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_varies_by_component() {
        let base = fingerprint("run-1", "tool", 1, r#"{"x":1}"#);
        assert_ne!(base, fingerprint("run-2", "tool", 1, r#"{"x":1}"#));
        assert_ne!(base, fingerprint("run-1", "other", 1, r#"{"x":1}"#));
        assert_ne!(base, fingerprint("run-1", "tool", 2, r#"{"x":1}"#));
        assert_ne!(base, fingerprint("run-1", "tool", 1, r#"{"x":2}"#));
    }

    #[tokio::test]
    async fn test_begin_then_complete_then_reuse() {
        let store = InMemoryIdempotencyStore::new();
        let fp = fingerprint("run-1", "tool", 1, "{}");

        assert!(matches!(
            store.begin(&fp, "run-1", "tool", 1).await.unwrap(),
            BeginOutcome::Acquired
        ));
        store.complete(&fp, json!({"out": 42})).await.unwrap();

        match store.begin(&fp, "run-1", "tool", 1).await.unwrap() {
            BeginOutcome::Done(Some(result)) => assert_eq!(result, json!({"out": 42})),
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_in_flight_blocks_second_claim() {
        let store = InMemoryIdempotencyStore::new();
        let fp = fingerprint("run-1", "tool", 1, "{}");

        store.begin(&fp, "run-1", "tool", 1).await.unwrap();
        assert!(matches!(
            store.begin(&fp, "run-1", "tool", 1).await.unwrap(),
            BeginOutcome::InFlight { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_entry_allows_fresh_claim() {
        let store = InMemoryIdempotencyStore::new();
        let fp = fingerprint("run-1", "tool", 1, "{}");

        store.begin(&fp, "run-1", "tool", 1).await.unwrap();
        store.fail(&fp).await.unwrap();

        assert!(matches!(
            store.begin(&fp, "run-1", "tool", 1).await.unwrap(),
            BeginOutcome::Acquired
        ));
    }

    #[tokio::test]
    async fn test_expired_in_flight_is_reclaimable() {
        let store = InMemoryIdempotencyStore::with_ttl(Duration::seconds(-1));
        let fp = fingerprint("run-1", "tool", 1, "{}");

        store.begin(&fp, "run-1", "tool", 1).await.unwrap();
        // Entry was born expired, so the next claim acquires.
        assert!(matches!(
            store.begin(&fp, "run-1", "tool", 1).await.unwrap(),
            BeginOutcome::Acquired
        ));
    }
}
