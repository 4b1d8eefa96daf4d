//! In-memory checkpoint store
//!
//! Reference implementation that keeps all checkpoints in process memory.
//! Suitable for development, testing, and single-process deployments; for
//! durable persistence implement [`CheckpointStore`] against your preferred
//! backend.

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default checkpoint retention: 7 days.
const DEFAULT_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// In-memory [`CheckpointStore`] implementation
///
/// Checkpoints saved without an explicit `expires_at` receive
/// `created_at + ttl`; expired entries load as absent and are dropped
/// lazily.
#[derive(Debug, Clone)]
pub struct InMemoryCheckpointStore {
    storage: Arc<RwLock<HashMap<String, Checkpoint>>>,
    ttl: Duration,
}

impl InMemoryCheckpointStore {
    /// Create a store with the default 7-day TTL
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_TTL_SECS))
    }

    /// Create a store with a custom retention TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Number of stored checkpoints, including not-yet-purged expired ones
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Drop all expired checkpoints, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut storage = self.storage.write().await;
        let before = storage.len();
        storage.retain(|_, cp| !cp.is_expired());
        before - storage.len()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, mut checkpoint: Checkpoint) -> Result<()> {
        if checkpoint.expires_at.is_none() {
            checkpoint.expires_at = Some(checkpoint.created_at + self.ttl);
        }
        let mut storage = self.storage.write().await;
        storage.insert(checkpoint.run_id.clone(), checkpoint);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        {
            let storage = self.storage.read().await;
            match storage.get(run_id) {
                Some(cp) if !cp.is_expired() => return Ok(Some(cp.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Found but expired: drop it so the map does not grow unbounded.
        self.storage.write().await.remove(run_id);
        Ok(None)
    }

    async fn list_by_state(
        &self,
        graph_id: &str,
        execution_state: &str,
    ) -> Result<Vec<Checkpoint>> {
        let storage = self.storage.read().await;
        let now = Utc::now();
        let mut matches: Vec<Checkpoint> = storage
            .values()
            .filter(|cp| {
                cp.graph_id == graph_id
                    && cp.execution_state == execution_state
                    && cp.expires_at.map(|t| t > now).unwrap_or(true)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        self.storage.write().await.remove(run_id);
        Ok(())
    }
}
