//! Human-response queue
//!
//! Responses arrive over an external queue - in-memory here, a Redis-list
//! style backend behind the same trait in deployments. The wire shape
//! mirrors the prompt event: the responder echoes back `runId`, `nodeId`,
//! and `invocationIndex` along with the selection or free text.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spice_core::HumanResponse;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// One queued human response (wire shape)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub run_id: String,
    pub node_id: String,
    pub invocation_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_option_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_text: Option<String>,
}

impl QueuedResponse {
    pub fn selection<I, S>(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        invocation_index: u32,
        ids: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            invocation_index,
            selected_option_ids: Some(ids.into_iter().map(Into::into).collect()),
            free_text: None,
        }
    }

    pub fn text(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        invocation_index: u32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            invocation_index,
            selected_option_ids: None,
            free_text: Some(text.into()),
        }
    }

    /// The payload handed to the runner on resume
    pub fn to_human_response(&self) -> HumanResponse {
        HumanResponse {
            selected_option_ids: self.selected_option_ids.clone(),
            free_text: self.free_text.clone(),
        }
    }
}

/// Queue the arbiter consumes responses from
#[async_trait]
pub trait ResponseQueue: Send + Sync {
    /// Enqueue a response (producer side)
    async fn push(&self, response: QueuedResponse) -> Result<()>;

    /// Dequeue the next response, waiting up to `timeout`
    async fn pop(&self, timeout: Duration) -> Result<Option<QueuedResponse>>;
}

/// In-memory list-backed [`ResponseQueue`]
#[derive(Default)]
pub struct InMemoryResponseQueue {
    items: Mutex<VecDeque<QueuedResponse>>,
    notify: Arc<Notify>,
}

impl InMemoryResponseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[async_trait]
impl ResponseQueue for InMemoryResponseQueue {
    async fn push(&self, response: QueuedResponse) -> Result<()> {
        self.items.lock().await.push_back(response);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<QueuedResponse>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().await.pop_front() {
                return Ok(Some(item));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryResponseQueue::new();
        queue
            .push(QueuedResponse::selection("r1", "n", 0, ["a"]))
            .await
            .unwrap();
        queue
            .push(QueuedResponse::text("r2", "n", 0, "hi"))
            .await
            .unwrap();

        let first = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.run_id, "r1");
        let second = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.run_id, "r2");
        assert!(queue.pop(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(InMemoryResponseQueue::new());

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer
                .push(QueuedResponse::text("r1", "n", 0, "hi"))
                .await
                .unwrap();
        });

        let popped = queue.pop(Duration::from_secs(5)).await.unwrap();
        assert!(popped.is_some());
    }

    #[test]
    fn test_wire_shape() {
        let response = QueuedResponse::selection("run-1", "select", 2, ["ok"]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["runId"], "run-1");
        assert_eq!(json["nodeId"], "select");
        assert_eq!(json["invocationIndex"], 2);
        assert_eq!(json["selectedOptionIds"][0], "ok");
        assert!(json.get("freeText").is_none());
    }
}
