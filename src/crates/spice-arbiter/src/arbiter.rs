//! The arbiter consumer loop

use crate::error::{ArbiterError, Result};
use crate::provider::GraphProvider;
use crate::queue::{QueuedResponse, ResponseQueue};
use parking_lot::Mutex;
use spice_checkpoint::{Checkpoint, CheckpointStore};
use spice_core::{GraphRunner, PendingInteraction, RunReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tuning for an [`Arbiter`]
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// How long each queue poll blocks before re-checking for shutdown
    pub poll_timeout: Duration,
    /// Ceiling on parent-checkpoint hops when routing subgraph responses
    pub max_ancestor_depth: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(200),
            max_ancestor_depth: 32,
        }
    }
}

type ReportHook = Arc<dyn Fn(&RunReport) + Send + Sync>;

struct Inner {
    queue: Arc<dyn ResponseQueue>,
    provider: Arc<dyn GraphProvider>,
    checkpoints: Arc<dyn CheckpointStore>,
    runner: GraphRunner,
    config: ArbiterConfig,
    report_hook: Option<ReportHook>,
}

/// Consumes queued human responses and resumes the matching paused runs
///
/// Lifecycle is cooperative: [`start`](Self::start) spawns the consumer
/// task, [`stop`](Self::stop) cancels it and waits for any in-flight
/// resume to finish draining.
pub struct Arbiter {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Arbiter {
    pub fn new(
        queue: Arc<dyn ResponseQueue>,
        provider: Arc<dyn GraphProvider>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                provider,
                checkpoints,
                runner: GraphRunner::new(),
                config: ArbiterConfig::default(),
                report_hook: None,
            }),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Replace the runner used for resumes (before `start`)
    pub fn with_runner(mut self, runner: GraphRunner) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configure the arbiter before starting it")
            .runner = runner;
        self
    }

    pub fn with_config(mut self, config: ArbiterConfig) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configure the arbiter before starting it")
            .config = config;
        self
    }

    /// Observe every resume's report (before `start`)
    pub fn with_report_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RunReport) + Send + Sync + 'static,
    {
        Arc::get_mut(&mut self.inner)
            .expect("configure the arbiter before starting it")
            .report_hook = Some(Arc::new(hook));
        self
    }

    /// Spawn the consumer loop (idempotent)
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(async move {
            tracing::info!("Arbiter consumer loop started");
            loop {
                let popped = tokio::select! {
                    _ = cancel.cancelled() => break,
                    popped = inner.queue.pop(inner.config.poll_timeout) => popped,
                };
                match popped {
                    Ok(Some(response)) => {
                        // Resumes are not cancelled mid-flight; stop()
                        // waits for this to finish.
                        if let Err(e) = Self::process_inner(&inner, response).await {
                            tracing::warn!(error = %e, "Failed to process human response");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Response queue poll failed");
                    }
                }
            }
            tracing::info!("Arbiter consumer loop stopped");
        }));
    }

    /// Cancel the loop and drain the in-flight resume
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Drive one response synchronously (also used by the loop)
    pub async fn process(&self, response: QueuedResponse) -> Result<RunReport> {
        Self::process_inner(&self.inner, response).await
    }

    async fn process_inner(inner: &Inner, response: QueuedResponse) -> Result<RunReport> {
        let checkpoint = Self::root_checkpoint(inner, &response).await?;

        if checkpoint.execution_state != "WAITING" {
            return Err(ArbiterError::Correlation(format!(
                "run '{}' is {}, not WAITING",
                checkpoint.run_id, checkpoint.execution_state
            )));
        }

        // The pending descriptor names the human node that actually asked,
        // even when the pause bubbled up from a subgraph.
        let pending: Option<PendingInteraction> = checkpoint
            .pending_interaction
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ArbiterError::Correlation(e.to_string()))?;
        if let Some(pending) = &pending {
            if pending.node_id != response.node_id {
                return Err(ArbiterError::Correlation(format!(
                    "response targets node '{}' but run '{}' waits on '{}'",
                    response.node_id, checkpoint.run_id, pending.node_id
                )));
            }
            if pending.invocation_index != response.invocation_index {
                return Err(ArbiterError::Correlation(format!(
                    "response is for invocation {} but run '{}' waits on invocation {}",
                    response.invocation_index, checkpoint.run_id, pending.invocation_index
                )));
            }
        }

        let graph = inner
            .provider
            .graph(&checkpoint.graph_id)
            .ok_or_else(|| ArbiterError::UnknownGraph(checkpoint.graph_id.clone()))?;

        tracing::info!(
            run_id = %checkpoint.run_id,
            node_id = %response.node_id,
            invocation_index = response.invocation_index,
            "Resuming paused run from human response"
        );
        let report = inner
            .runner
            .resume(&graph, &checkpoint.run_id, Some(response.to_human_response()))
            .await?;

        if let Some(hook) = &inner.report_hook {
            hook(&report);
        }
        Ok(report)
    }

    /// Load the response's checkpoint and walk up to the root ancestor
    ///
    /// Subgraph prompts carry the child's run id; resuming must start at
    /// the root run so the whole ancestor chain advances.
    async fn root_checkpoint(inner: &Inner, response: &QueuedResponse) -> Result<Checkpoint> {
        let mut checkpoint = inner
            .checkpoints
            .load(&response.run_id)
            .await?
            .ok_or_else(|| ArbiterError::NoMatchingCheckpoint {
                run_id: response.run_id.clone(),
                node_id: response.node_id.clone(),
            })?;

        let mut hops = 0;
        while let Some(parent_run_id) = checkpoint.parent_run_id.clone() {
            hops += 1;
            if hops > inner.config.max_ancestor_depth {
                return Err(ArbiterError::Correlation(format!(
                    "ancestor chain for run '{}' exceeds {} hops",
                    response.run_id, inner.config.max_ancestor_depth
                )));
            }
            checkpoint = inner.checkpoints.load(&parent_run_id).await?.ok_or_else(|| {
                ArbiterError::NoMatchingCheckpoint {
                    run_id: parent_run_id.clone(),
                    node_id: response.node_id.clone(),
                }
            })?;
        }
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::GraphRegistry;
    use crate::queue::InMemoryResponseQueue;
    use spice_checkpoint::InMemoryCheckpointStore;
    use spice_core::{
        build_graph, HumanNode, Message, Node, OutputNode, PromptOption, RunStatus, SubgraphNode,
        Value,
    };

    fn approval_graph(store: Arc<InMemoryCheckpointStore>) -> Arc<spice_core::Graph> {
        Arc::new(
            build_graph("approval", |g| {
                g.with_checkpoint_store(store.clone());
                g.add_node(Node::Human(HumanNode::selection(
                    "select",
                    "Pick one",
                    vec![
                        PromptOption::new("ok", "OK"),
                        PromptOption::new("cancel", "Cancel"),
                    ],
                )));
                g.add_node(Node::Output(OutputNode::new("out").with_selector(|m| {
                    m.get_data("select").cloned().unwrap_or(Value::Null)
                })));
                g.connect("select", "out");
                g.entry("select");
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_arbiter_resumes_paused_run() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let graph = approval_graph(store.clone());

        let registry = Arc::new(GraphRegistry::new());
        registry.register(graph.clone());

        let runner = GraphRunner::new();
        let report = runner
            .run(&graph, Message::new("start", "user"))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Paused);
        let pending = report.pending_interaction.unwrap();

        let queue = Arc::new(InMemoryResponseQueue::new());
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = parking_lot::Mutex::new(Some(done_tx));

        let arbiter = Arbiter::new(queue.clone(), registry, store.clone())
            .with_report_hook(move |report| {
                assert_eq!(report.status, RunStatus::Success);
                assert_eq!(report.result, Some(Value::from("ok")));
                if let Some(tx) = done_tx.lock().take() {
                    let _ = tx.send(());
                }
            });
        arbiter.start();

        queue
            .push(QueuedResponse::selection(
                pending.run_id.clone(),
                pending.node_id.clone(),
                pending.invocation_index,
                ["ok"],
            ))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("arbiter resumed the run")
            .unwrap();
        arbiter.stop().await;
    }

    #[tokio::test]
    async fn test_arbiter_routes_child_response_to_root_run() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let child = approval_graph(store.clone());

        let parent = Arc::new(
            build_graph("parent", |g| {
                g.with_checkpoint_store(store.clone());
                g.add_node(Node::Subgraph(
                    SubgraphNode::new("review", child.clone()).map_output("select", "decision"),
                ));
                g.add_node(Node::Output(OutputNode::new("out").with_selector(|m| {
                    m.get_data("decision").cloned().unwrap_or(Value::Null)
                })));
                g.connect("review", "out");
                g.entry("review");
            })
            .unwrap(),
        );

        let registry = Arc::new(GraphRegistry::new());
        registry.register(parent.clone());
        registry.register(child);

        let runner = GraphRunner::new();
        let report = runner
            .run(&parent, Message::new("review this", "user"))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Paused);
        let pending = report.pending_interaction.unwrap();
        // The prompt names the child run.
        assert!(pending.run_id.contains(":subgraph:"));

        let queue = Arc::new(InMemoryResponseQueue::new());
        let arbiter = Arbiter::new(queue.clone(), registry, store.clone());

        let resumed = arbiter
            .process(QueuedResponse::selection(
                pending.run_id,
                pending.node_id,
                pending.invocation_index,
                ["ok"],
            ))
            .await
            .unwrap();

        assert_eq!(resumed.status, RunStatus::Success);
        assert_eq!(resumed.result, Some(Value::from("ok")));
    }

    #[tokio::test]
    async fn test_mismatched_response_is_rejected() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let graph = approval_graph(store.clone());
        let registry = Arc::new(GraphRegistry::new());
        registry.register(graph.clone());

        let report = GraphRunner::new()
            .run(&graph, Message::new("start", "user"))
            .await
            .unwrap();
        let pending = report.pending_interaction.unwrap();

        let queue = Arc::new(InMemoryResponseQueue::new());
        let arbiter = Arbiter::new(queue, registry, store);

        // Wrong node id.
        let err = arbiter
            .process(QueuedResponse::selection(
                pending.run_id.clone(),
                "other-node",
                pending.invocation_index,
                ["ok"],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::Correlation(_)));

        // Stale invocation index.
        let err = arbiter
            .process(QueuedResponse::selection(
                pending.run_id.clone(),
                pending.node_id.clone(),
                pending.invocation_index + 1,
                ["ok"],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::Correlation(_)));

        // Unknown run.
        let err = arbiter
            .process(QueuedResponse::selection("ghost", "select", 0, ["ok"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::NoMatchingCheckpoint { .. }));
    }
}
