//! Graph runner
//!
//! Traverses a graph from its entry point, executing each node through the
//! middleware chain with idempotency and retry, persisting checkpoints at
//! node boundaries, and emitting lifecycle events. A node yielding WAITING
//! pauses the run - the checkpoint is persisted, control returns to the
//! caller, and no task is held until `resume` is called with the human
//! response.

use crate::context::RunContext;
use crate::edge::select_edge;
use crate::error::{Result, SpiceError};
use crate::events::{self, EventEmitter};
use crate::graph::Graph;
use crate::message::Message;
use crate::middleware::{aggregate_error_actions, run_chain, ErrorContext, NodeRequest};
use crate::node::{
    default_preserve_keys, AgentNode, AgentReply, HumanResponse, Node, PendingInteraction,
    PromptOption, SelectionType, SubgraphNode, ToolNode,
};
use crate::report::{NodeReport, NodeStatus, RunReport, RunStatus};
use crate::retry::{ExecutionRetryPolicy, RetryOutcome, RetrySupervisor};
use crate::state::ExecutionState;
use crate::toolcall::ToolCall;
use crate::value::{canonical_json, canonical_json_map, Value};
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use spice_checkpoint::{fingerprint, BeginOutcome, Checkpoint, IdempotencyStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runner-level configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-run step ceiling for graphs that allow cycles
    pub step_cap: u32,
    /// Default retry policy (graph-level policies override it)
    pub retry_policy: ExecutionRetryPolicy,
    /// Re-check interval while another attempt holds an idempotency claim
    pub idempotency_wait: Duration,
    /// How long to wait on an in-flight claim before failing
    pub idempotency_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            step_cap: 10_000,
            retry_policy: ExecutionRetryPolicy::default(),
            idempotency_wait: Duration::from_millis(50),
            idempotency_timeout: Duration::from_secs(5),
        }
    }
}

enum ExecOutcome {
    Advanced {
        message: Message,
    },
    Waiting {
        message: Message,
        pending: Option<PendingInteraction>,
    },
}

enum Claim {
    Acquired,
    Done(serde_json::Value),
}

/// Executes graphs against messages
#[derive(Debug, Default, Clone)]
pub struct GraphRunner {
    config: RunnerConfig,
}

impl GraphRunner {
    pub fn new() -> Self {
        Self {
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run a graph against an initial message
    ///
    /// Returns a report rather than an error for run-level failures: a
    /// failed node yields `RunStatus::Failed` with the structured error and
    /// partial node reports retained.
    pub async fn run(&self, graph: &Graph, initial: Message) -> Result<RunReport> {
        let ctx = RunContext::new(graph.id.clone()).capture_values(&initial, &default_preserve_keys());
        self.run_with_context(graph, initial, ctx).await
    }

    /// Run with a caller-supplied context (cancellation token, run id)
    pub fn run_with_context<'a>(
        &'a self,
        graph: &'a Graph,
        initial: Message,
        ctx: RunContext,
    ) -> BoxFuture<'a, Result<RunReport>> {
        Box::pin(async move {
            let emitter = EventEmitter::new(graph.event_bus.clone());

            let message = if initial.state == ExecutionState::Running {
                initial
            } else {
                initial.transition_to(
                    ExecutionState::Running,
                    Some("graph start".to_string()),
                    None,
                )?
            };

            emitter
                .emit(
                    events::LIFECYCLE_CHANNEL,
                    events::EVENT_RUN_STARTED,
                    json!({
                        "runId": ctx.run_id,
                        "graphId": graph.id,
                        "correlationId": message.correlation_id,
                    }),
                    &ctx,
                )
                .await;

            self.execute_from(graph, &emitter, ctx, message, graph.entry_point.clone(), Vec::new())
                .await
        })
    }

    /// Resume a paused run from its checkpoint
    ///
    /// Verifies the checkpoint belongs to this graph and is WAITING, merges
    /// the human response into `data` under the paused node's id, and
    /// continues from the paused node's outgoing edges. An expired HITL
    /// timeout fails the run with reason "hitl timeout".
    pub async fn resume(
        &self,
        graph: &Graph,
        checkpoint_id: &str,
        response: Option<HumanResponse>,
    ) -> Result<RunReport> {
        self.resume_inner(graph, checkpoint_id.to_string(), response)
            .await
    }

    fn resume_inner<'a>(
        &'a self,
        graph: &'a Graph,
        checkpoint_id: String,
        response: Option<HumanResponse>,
    ) -> BoxFuture<'a, Result<RunReport>> {
        Box::pin(async move {
            let store = graph.checkpoint_store.clone().ok_or_else(|| {
                SpiceError::Configuration("resume requires a checkpoint store".to_string())
            })?;
            let checkpoint = store.load(&checkpoint_id).await?.ok_or_else(|| {
                spice_checkpoint::CheckpointError::NotFound(checkpoint_id.clone())
            })?;

            if checkpoint.graph_id != graph.id {
                return Err(SpiceError::Validation(format!(
                    "checkpoint '{}' belongs to graph '{}', not '{}'",
                    checkpoint_id, checkpoint.graph_id, graph.id
                )));
            }
            if checkpoint.execution_state != ExecutionState::Waiting.as_str() {
                return Err(SpiceError::Validation(format!(
                    "checkpoint '{}' is {}, only WAITING runs can resume",
                    checkpoint_id, checkpoint.execution_state
                )));
            }

            let message: Message = serde_json::from_value(checkpoint.message.clone())?;
            let pending: Option<PendingInteraction> = checkpoint
                .pending_interaction
                .clone()
                .map(serde_json::from_value)
                .transpose()?;

            let ctx = RunContext::with_run_id(checkpoint.run_id.clone(), graph.id.clone())
                .capture_values(&message, &default_preserve_keys());
            let emitter = EventEmitter::new(graph.event_bus.clone());

            if let Some(p) = &pending {
                // The next entry of the paused node must get a fresh prompt id.
                ctx.restore_invocation_index(&p.node_id, p.invocation_index + 1);

                if let Some(timeout_ms) = p.timeout_ms {
                    let deadline =
                        checkpoint.created_at + chrono::Duration::milliseconds(timeout_ms as i64);
                    if Utc::now() >= deadline {
                        return self
                            .fail_run(
                                graph,
                                &emitter,
                                &ctx,
                                message,
                                Vec::new(),
                                &checkpoint.node_id,
                                SpiceError::Timeout {
                                    operation: format!(
                                        "human response for node '{}'",
                                        checkpoint.node_id
                                    ),
                                    duration_ms: timeout_ms,
                                },
                                Some("hitl timeout".to_string()),
                            )
                            .await;
                    }
                }
            }

            let node = graph.node(&checkpoint.node_id).ok_or_else(|| {
                SpiceError::Validation(format!(
                    "checkpoint references unknown node '{}'",
                    checkpoint.node_id
                ))
            })?;

            // A pause that bubbled up from a subgraph resumes the child first.
            if let (Node::Subgraph(sub), Some(p)) = (node, &pending) {
                if let Some(child_checkpoint) = p.child_checkpoint_id.clone() {
                    return self
                        .resume_subgraph(
                            graph, &emitter, ctx, sub, message, checkpoint, p.clone(),
                            child_checkpoint, response,
                        )
                        .await;
                }
            }

            let mut message = message;
            if let Some(resp) = &response {
                let selection_type = pending
                    .as_ref()
                    .map(|p| p.selection_type)
                    .unwrap_or(SelectionType::FreeText);
                message = message.with_data(
                    checkpoint.node_id.clone(),
                    resp.to_value(selection_type),
                );
            }
            let message = message.transition_to(
                ExecutionState::Running,
                Some("resume".to_string()),
                Some(checkpoint.node_id.clone()),
            )?;

            emitter
                .emit(
                    events::LIFECYCLE_CHANNEL,
                    events::EVENT_RUN_RESUMED,
                    json!({
                        "runId": ctx.run_id,
                        "graphId": graph.id,
                        "nodeId": checkpoint.node_id,
                    }),
                    &ctx,
                )
                .await;

            self.continue_from(graph, &emitter, ctx, message, &checkpoint.node_id, Vec::new())
                .await
        })
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    /// Route from an already-executed node and keep walking
    async fn continue_from(
        &self,
        graph: &Graph,
        emitter: &EventEmitter,
        ctx: RunContext,
        message: Message,
        from_node: &str,
        reports: Vec<NodeReport>,
    ) -> Result<RunReport> {
        match select_edge(graph.edges(), from_node, &message) {
            Some(edge) => {
                let next = edge.to.clone();
                self.execute_from(graph, emitter, ctx, message, next, reports)
                    .await
            }
            None => {
                if let Some(Node::Output(out)) = graph.node(from_node) {
                    return self
                        .complete_run(graph, emitter, &ctx, message, reports, out)
                        .await;
                }
                let error = SpiceError::Validation(format!(
                    "node '{}' has no matching outgoing edge",
                    from_node
                ));
                self.fail_run(graph, emitter, &ctx, message, reports, from_node, error, None)
                    .await
            }
        }
    }

    /// Main traversal loop, starting by executing `current_id`
    fn execute_from<'a>(
        &'a self,
        graph: &'a Graph,
        emitter: &'a EventEmitter,
        ctx: RunContext,
        mut message: Message,
        mut current_id: String,
        mut reports: Vec<NodeReport>,
    ) -> BoxFuture<'a, Result<RunReport>> {
        Box::pin(async move {
            let mut visited: HashSet<String> = HashSet::new();
            let mut steps: u32 = 0;

            loop {
                if ctx.is_cancelled() {
                    return self
                        .cancel_run(graph, emitter, &ctx, message, reports, &current_id)
                        .await;
                }

                // Cycle control: visited-set for acyclic graphs, step cap
                // for cyclic ones.
                if !graph.allow_cycles {
                    if !visited.insert(current_id.clone()) {
                        let error = SpiceError::CycleDetected {
                            node: current_id.clone(),
                        };
                        return self
                            .fail_run(
                                graph, emitter, &ctx, message, reports, &current_id, error, None,
                            )
                            .await;
                    }
                } else {
                    steps += 1;
                    if steps > self.config.step_cap {
                        let error = SpiceError::Execution {
                            message: format!(
                                "step cap of {} exceeded in cyclic graph",
                                self.config.step_cap
                            ),
                            retries_exhausted: false,
                            total_attempts: 0,
                            last_status_code: None,
                            elapsed_ms: 0,
                        };
                        return self
                            .fail_run(
                                graph, emitter, &ctx, message, reports, &current_id, error, None,
                            )
                            .await;
                    }
                }

                let node = graph.node(&current_id).ok_or_else(|| {
                    SpiceError::Validation(format!("unknown node '{}'", current_id))
                })?;

                let started = Instant::now();
                let (result, attempts) = self.execute_node(graph, node, &message, &ctx).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                match result {
                    Ok(ExecOutcome::Advanced { message: new_message }) => {
                        reports.push(NodeReport {
                            node_id: current_id.clone(),
                            status: NodeStatus::Success,
                            attempts,
                            duration_ms,
                            output: new_message.get_data(&current_id).cloned(),
                            error: None,
                        });
                        message = new_message;

                        emitter
                            .emit(
                                events::LIFECYCLE_CHANNEL,
                                events::EVENT_NODE_COMPLETED,
                                json!({
                                    "runId": ctx.run_id,
                                    "graphId": graph.id,
                                    "nodeId": current_id,
                                    "kind": node.kind(),
                                    "attempts": attempts,
                                    "durationMs": duration_ms,
                                }),
                                &ctx,
                            )
                            .await;

                        self.save_checkpoint(graph, &ctx, &current_id, &message, None)
                            .await?;

                        match select_edge(graph.edges(), &current_id, &message) {
                            Some(edge) => {
                                current_id = edge.to.clone();
                            }
                            None => {
                                if let Node::Output(out) = node {
                                    return self
                                        .complete_run(graph, emitter, &ctx, message, reports, out)
                                        .await;
                                }
                                let error = SpiceError::Validation(format!(
                                    "node '{}' has no matching outgoing edge",
                                    current_id
                                ));
                                return self
                                    .fail_run(
                                        graph, emitter, &ctx, message, reports, &current_id,
                                        error, None,
                                    )
                                    .await;
                            }
                        }
                    }
                    Ok(ExecOutcome::Waiting { message: waiting, pending }) => {
                        reports.push(NodeReport {
                            node_id: current_id.clone(),
                            status: NodeStatus::Waiting,
                            attempts,
                            duration_ms,
                            output: None,
                            error: None,
                        });
                        return self
                            .pause_run(graph, emitter, &ctx, waiting, reports, &current_id, pending)
                            .await;
                    }
                    Err(SpiceError::Cancelled) => {
                        return self
                            .cancel_run(graph, emitter, &ctx, message, reports, &current_id)
                            .await;
                    }
                    Err(error) => {
                        reports.push(NodeReport {
                            node_id: current_id.clone(),
                            status: NodeStatus::Failed,
                            attempts,
                            duration_ms,
                            output: None,
                            error: Some(error.to_string()),
                        });
                        return self
                            .fail_run(
                                graph, emitter, &ctx, message, reports, &current_id, error, None,
                            )
                            .await;
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Node execution (middleware + retry + idempotency)
    // -----------------------------------------------------------------------

    async fn execute_node(
        &self,
        graph: &Graph,
        node: &Node,
        message: &Message,
        ctx: &RunContext,
    ) -> (Result<ExecOutcome>, u32) {
        let policy = RetrySupervisor::effective_policy(
            graph.retry_policy.as_ref(),
            &self.config.retry_policy,
            graph.retry_enabled,
        );
        let supervisor = RetrySupervisor::new(policy);
        let pending_slot: Arc<Mutex<Option<PendingInteraction>>> = Arc::new(Mutex::new(None));

        // Claimed once per node entry so retries reuse the same prompt id;
        // loop re-entries claim a fresh index.
        let human_invocation = match node {
            Node::Human(human) => Some(ctx.next_invocation_index(&human.id)),
            _ => None,
        };

        let slot = pending_slot.clone();
        let terminal = crate::middleware::terminal_fn(move |req: NodeRequest| {
            let slot = slot.clone();
            let fut: BoxFuture<'_, Result<Message>> = Box::pin(async move {
                self.execute_node_inner(graph, node, req.message, &req.ctx, req.attempt, &slot, human_invocation)
                    .await
            });
            fut
        });

        let mut attempts_seen: u32 = 0;
        let result = supervisor
            .execute(
                ctx,
                |attempt| {
                    attempts_seen = attempt;
                    let request = NodeRequest {
                        node_id: node.id().to_string(),
                        node_kind: node.kind(),
                        attempt,
                        message: message.clone(),
                        ctx: ctx.clone(),
                    };
                    run_chain(&graph.middleware, request, &terminal)
                },
                |error, attempt| {
                    let error_ctx = ErrorContext {
                        node_id: node.id(),
                        attempt,
                        run_id: &ctx.run_id,
                    };
                    aggregate_error_actions(&graph.middleware, error, &error_ctx)
                },
            )
            .await;

        let outcome = match result {
            Ok(RetryOutcome::Success { value, attempts }) => {
                attempts_seen = attempts;
                let pending = pending_slot.lock().take();
                if value.state == ExecutionState::Waiting {
                    Ok(ExecOutcome::Waiting {
                        message: value,
                        pending,
                    })
                } else {
                    Ok(ExecOutcome::Advanced { message: value })
                }
            }
            Ok(RetryOutcome::Skipped { attempts }) => {
                attempts_seen = attempts;
                tracing::debug!(node_id = %node.id(), "Node failure skipped by middleware");
                Ok(ExecOutcome::Advanced {
                    message: message.clone(),
                })
            }
            Err(error) => Err(error),
        };
        (outcome, attempts_seen.max(1))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_node_inner(
        &self,
        graph: &Graph,
        node: &Node,
        message: Message,
        ctx: &RunContext,
        attempt: u32,
        pending_slot: &Mutex<Option<PendingInteraction>>,
        human_invocation: Option<u32>,
    ) -> Result<Message> {
        ctx.ensure_active()?;
        match node {
            Node::Agent(agent) => self.run_agent(graph, agent, message, ctx, attempt).await,
            Node::Tool(tool) => self.run_tool(graph, tool, message, ctx, attempt).await,
            Node::Decision(decision) => decision.run(message),
            Node::EngineDecision(engine) => engine.run(message).await,
            Node::Human(human) => {
                let index = human_invocation.unwrap_or_else(|| ctx.invocation_index(&human.id));
                let (waiting, pending) = human.run_with_index(message, ctx, index)?;
                *pending_slot.lock() = Some(pending);
                Ok(waiting)
            }
            Node::Subgraph(sub) => {
                self.run_subgraph(graph, sub, message, ctx, pending_slot).await
            }
            // The output selector is applied when the run completes.
            Node::Output(_) => Ok(message),
            Node::Parallel(parallel) => parallel.run(message).await,
            Node::Custom(custom) => custom.run(message).await,
        }
    }

    async fn run_agent(
        &self,
        graph: &Graph,
        node: &AgentNode,
        message: Message,
        ctx: &RunContext,
        attempt: u32,
    ) -> Result<Message> {
        let Some(store) = graph.idempotency_store.clone() else {
            return node.run(message).await;
        };

        let inputs = canonical_json(&Value::Map(
            [(
                "content".to_string(),
                Value::String(node.input_content(&message)),
            )]
            .into(),
        ));
        let fp = fingerprint(&ctx.run_id, &node.id, attempt, &inputs);

        match self.claim(&*store, &fp, ctx, &node.id, attempt).await? {
            Claim::Done(stored) => {
                let reply: AgentReply = serde_json::from_value(stored)?;
                Ok(node.apply_reply(message, reply))
            }
            Claim::Acquired => match node.invoke(&message).await {
                Ok(reply) => {
                    store.complete(&fp, serde_json::to_value(&reply)?).await?;
                    Ok(node.apply_reply(message, reply))
                }
                Err(error) => {
                    if !error.is_retryable() {
                        store.fail(&fp).await?;
                    }
                    Err(error)
                }
            },
        }
    }

    async fn run_tool(
        &self,
        graph: &Graph,
        node: &ToolNode,
        message: Message,
        ctx: &RunContext,
        attempt: u32,
    ) -> Result<Message> {
        let tool = node.resolver.resolve(&graph.tool_registry, &message)?;
        let params = node.map_params(&message);

        let execute = || async {
            for listener in &graph.tool_listeners {
                listener.on_tool_start(&node.id, tool.name(), &params);
            }
            let started = Instant::now();
            match tool.execute(params.clone()).await {
                Ok(result) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    for listener in &graph.tool_listeners {
                        listener.on_tool_success(&node.id, tool.name(), duration_ms);
                    }
                    Ok(result)
                }
                Err(error) => {
                    for listener in &graph.tool_listeners {
                        listener.on_tool_error(&node.id, tool.name(), &error);
                    }
                    Err(error)
                }
            }
        };

        let result = if let Some(store) = graph.idempotency_store.clone() {
            let inputs = canonical_json_map(&params);
            let fp = fingerprint(&ctx.run_id, &node.id, attempt, &inputs);
            match self.claim(&*store, &fp, ctx, &node.id, attempt).await? {
                Claim::Done(stored) => Value::from(stored),
                Claim::Acquired => match execute().await {
                    Ok(result) => {
                        store
                            .complete(&fp, serde_json::Value::from(result.clone()))
                            .await?;
                        result
                    }
                    Err(error) => {
                        if !error.is_retryable() {
                            store.fail(&fp).await?;
                        }
                        return Err(error);
                    }
                },
            }
        } else {
            execute().await?
        };

        EventEmitter::new(graph.event_bus.clone())
            .emit(
                events::TOOL_CHANNEL,
                events::EVENT_TOOL_CALLED,
                json!({
                    "runId": ctx.run_id,
                    "nodeId": node.id,
                    "tool": tool.name(),
                    "attempt": attempt,
                }),
                ctx,
            )
            .await;

        Ok(node.apply_result(message, result))
    }

    /// Claim an idempotency fingerprint, waiting out in-flight holders
    async fn claim(
        &self,
        store: &dyn IdempotencyStore,
        fp: &str,
        ctx: &RunContext,
        node_id: &str,
        attempt: u32,
    ) -> Result<Claim> {
        let deadline = Instant::now() + self.config.idempotency_timeout;
        loop {
            match store.begin(fp, &ctx.run_id, node_id, attempt).await? {
                BeginOutcome::Acquired => return Ok(Claim::Acquired),
                BeginOutcome::Done(result) => {
                    tracing::debug!(
                        node_id,
                        attempt,
                        "Reusing stored idempotent result without re-executing"
                    );
                    return Ok(Claim::Done(result.unwrap_or(serde_json::Value::Null)));
                }
                BeginOutcome::InFlight { .. } => {
                    if Instant::now() >= deadline {
                        return Err(SpiceError::ConcurrentAttempt {
                            fingerprint: fp.to_string(),
                        });
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idempotency_wait) => {}
                        _ = ctx.cancellation.cancelled() => return Err(SpiceError::Cancelled),
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subgraph
    // -----------------------------------------------------------------------

    async fn run_subgraph(
        &self,
        _parent: &Graph,
        node: &SubgraphNode,
        message: Message,
        ctx: &RunContext,
        pending_slot: &Mutex<Option<PendingInteraction>>,
    ) -> Result<Message> {
        let child_depth = ctx.depth + 1;
        if child_depth > node.max_depth {
            return Err(SpiceError::DepthExceeded {
                depth: child_depth,
                max_depth: node.max_depth,
            });
        }

        let child_run_id = format!("{}:subgraph:{}", ctx.run_id, node.id);
        let child_ctx = ctx.child(child_run_id.clone(), node.graph.id.clone());

        let mut child = Message::new(message.content.clone(), format!("subgraph:{}", node.id))
            .with_correlation_id(message.correlation_id.clone())
            .with_causation_id(message.id.clone());
        for key in &node.preserve_keys {
            if let Some(value) = message.get_metadata(key) {
                child = child.with_metadata(key.clone(), value.clone());
            }
        }
        for (child_key, template) in &node.input_mapping {
            let value = crate::template::resolve_template(template, &message)?;
            child = child.with_data(child_key.clone(), value);
        }

        let report = self
            .run_with_context(&node.graph, child, child_ctx)
            .await?;

        match report.status {
            RunStatus::Success => {
                Ok(self.apply_output_mapping(node, message, report.message.as_ref()))
            }
            RunStatus::Paused => {
                let child_checkpoint = report
                    .checkpoint_id
                    .clone()
                    .unwrap_or_else(|| child_run_id.clone());
                let pending = report
                    .pending_interaction
                    .map(|mut p| {
                        p.child_checkpoint_id = Some(child_checkpoint.clone());
                        p
                    })
                    .unwrap_or_else(|| {
                        self.synthetic_pending(ctx, &node.id, &child_checkpoint)
                    });
                let waiting = message.transition_to(
                    ExecutionState::Waiting,
                    Some("subgraph awaiting human response".to_string()),
                    Some(node.id.clone()),
                )?;
                *pending_slot.lock() = Some(pending);
                Ok(waiting)
            }
            RunStatus::Cancelled => Err(SpiceError::Cancelled),
            RunStatus::Failed => Err(report.error.unwrap_or_else(|| SpiceError::Execution {
                message: format!("subgraph '{}' failed", node.id),
                retries_exhausted: false,
                total_attempts: 0,
                last_status_code: None,
                elapsed_ms: 0,
            })),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn resume_subgraph(
        &self,
        graph: &Graph,
        emitter: &EventEmitter,
        ctx: RunContext,
        node: &SubgraphNode,
        message: Message,
        checkpoint: Checkpoint,
        pending: PendingInteraction,
        child_checkpoint: String,
        response: Option<HumanResponse>,
    ) -> Result<RunReport> {
        let child_report = self
            .resume_inner(&node.graph, child_checkpoint, response)
            .await?;

        match child_report.status {
            RunStatus::Success => {
                let merged =
                    self.apply_output_mapping(node, message, child_report.message.as_ref());
                let running = merged.transition_to(
                    ExecutionState::Running,
                    Some("resume".to_string()),
                    Some(node.id.clone()),
                )?;
                emitter
                    .emit(
                        events::LIFECYCLE_CHANNEL,
                        events::EVENT_RUN_RESUMED,
                        json!({
                            "runId": ctx.run_id,
                            "graphId": graph.id,
                            "nodeId": node.id,
                        }),
                        &ctx,
                    )
                    .await;
                self.continue_from(graph, emitter, ctx, running, &node.id, Vec::new())
                    .await
            }
            RunStatus::Paused => {
                // The child paused again on another interaction; re-pause
                // the parent with the refreshed descriptor.
                let pending = child_report
                    .pending_interaction
                    .map(|mut p| {
                        p.child_checkpoint_id = child_report.checkpoint_id.clone();
                        p
                    })
                    .unwrap_or(pending);
                self.pause_run(
                    graph,
                    emitter,
                    &ctx,
                    message,
                    Vec::new(),
                    &checkpoint.node_id,
                    Some(pending),
                )
                .await
            }
            RunStatus::Cancelled => {
                self.cancel_run(graph, emitter, &ctx, message, Vec::new(), &node.id)
                    .await
            }
            RunStatus::Failed => {
                let error = child_report.error.unwrap_or_else(|| SpiceError::Execution {
                    message: format!("subgraph '{}' failed on resume", node.id),
                    retries_exhausted: false,
                    total_attempts: 0,
                    last_status_code: None,
                    elapsed_ms: 0,
                });
                self.fail_run(
                    graph,
                    emitter,
                    &ctx,
                    message,
                    Vec::new(),
                    &node.id,
                    error,
                    None,
                )
                .await
            }
        }
    }

    fn apply_output_mapping(
        &self,
        node: &SubgraphNode,
        message: Message,
        child_message: Option<&Message>,
    ) -> Message {
        let Some(child) = child_message else {
            return message;
        };
        let mut updated = message;
        for (child_key, parent_key) in &node.output_mapping {
            if let Some(value) = child.data.get(child_key) {
                updated = updated.with_data(parent_key.clone(), value.clone());
            }
        }
        updated
    }

    fn synthetic_pending(
        &self,
        ctx: &RunContext,
        node_id: &str,
        child_checkpoint: &str,
    ) -> PendingInteraction {
        PendingInteraction {
            prompt_type: "request_user_input".to_string(),
            run_id: ctx.run_id.clone(),
            node_id: node_id.to_string(),
            invocation_index: 0,
            prompt: String::new(),
            options: Vec::<PromptOption>::new(),
            selection_type: SelectionType::FreeText,
            timeout_ms: None,
            correlation_id: ctx
                .value(crate::context::KEY_CORRELATION_ID)
                .unwrap_or_default()
                .to_string(),
            tenant_id: ctx.tenant_id().map(String::from),
            user_id: ctx.user_id().map(String::from),
            tool_call_id: ToolCall::stable_id(&ctx.run_id, node_id, 0),
            child_checkpoint_id: Some(child_checkpoint.to_string()),
        }
    }

    // -----------------------------------------------------------------------
    // Run termination paths
    // -----------------------------------------------------------------------

    async fn save_checkpoint(
        &self,
        graph: &Graph,
        ctx: &RunContext,
        node_id: &str,
        message: &Message,
        pending: Option<&PendingInteraction>,
    ) -> Result<Option<String>> {
        let Some(store) = &graph.checkpoint_store else {
            return Ok(None);
        };
        let mut checkpoint = Checkpoint::new(
            ctx.run_id.clone(),
            graph.id.clone(),
            node_id.to_string(),
            serde_json::to_value(message)?,
            message.state.as_str(),
        );
        if ctx.depth > 0 {
            // "{parent}:subgraph:{child}" run ids carry the parent prefix.
            if let Some((parent, _)) = ctx.run_id.rsplit_once(":subgraph:") {
                checkpoint = checkpoint.with_parent_run_id(parent.to_string());
            }
        }
        if let Some(pending) = pending {
            checkpoint = checkpoint.with_pending_interaction(serde_json::to_value(pending)?);
        }
        store.save(checkpoint).await?;
        Ok(Some(ctx.run_id.clone()))
    }

    async fn complete_run(
        &self,
        graph: &Graph,
        emitter: &EventEmitter,
        ctx: &RunContext,
        message: Message,
        reports: Vec<NodeReport>,
        output: &crate::node::OutputNode,
    ) -> Result<RunReport> {
        let result = output.select(&message);
        let message = message.transition_to(
            ExecutionState::Completed,
            Some("graph complete".to_string()),
            Some(output.id.clone()),
        )?;

        // A completed run has nothing to resume.
        if let Some(store) = &graph.checkpoint_store {
            store.delete(&ctx.run_id).await?;
        }

        emitter
            .emit(
                events::LIFECYCLE_CHANNEL,
                events::EVENT_RUN_COMPLETED,
                json!({
                    "runId": ctx.run_id,
                    "graphId": graph.id,
                    "result": serde_json::Value::from(result.clone()),
                }),
                ctx,
            )
            .await;

        Ok(RunReport {
            run_id: ctx.run_id.clone(),
            graph_id: graph.id.clone(),
            status: RunStatus::Success,
            result: Some(result),
            node_reports: reports,
            pending_interaction: None,
            checkpoint_id: None,
            message: Some(message),
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn pause_run(
        &self,
        graph: &Graph,
        emitter: &EventEmitter,
        ctx: &RunContext,
        message: Message,
        reports: Vec<NodeReport>,
        node_id: &str,
        pending: Option<PendingInteraction>,
    ) -> Result<RunReport> {
        let checkpoint_id = self
            .save_checkpoint(graph, ctx, node_id, &message, pending.as_ref())
            .await?;

        if let Some(pending) = &pending {
            emitter
                .emit(
                    events::HITL_CHANNEL,
                    events::EVENT_HITL_PROMPT,
                    pending.to_event_payload(),
                    ctx,
                )
                .await;
        }
        emitter
            .emit(
                events::LIFECYCLE_CHANNEL,
                events::EVENT_RUN_PAUSED,
                json!({
                    "runId": ctx.run_id,
                    "graphId": graph.id,
                    "nodeId": node_id,
                }),
                ctx,
            )
            .await;

        Ok(RunReport {
            run_id: ctx.run_id.clone(),
            graph_id: graph.id.clone(),
            status: RunStatus::Paused,
            result: None,
            node_reports: reports,
            pending_interaction: pending,
            checkpoint_id,
            message: Some(message),
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_run(
        &self,
        graph: &Graph,
        emitter: &EventEmitter,
        ctx: &RunContext,
        message: Message,
        reports: Vec<NodeReport>,
        node_id: &str,
        error: SpiceError,
        reason: Option<String>,
    ) -> Result<RunReport> {
        let reason = reason.unwrap_or_else(|| error.to_string());
        let message = message.transition_to(
            ExecutionState::Failed,
            Some(reason),
            Some(node_id.to_string()),
        )?;

        self.save_checkpoint(graph, ctx, node_id, &message, None).await?;

        emitter
            .emit(
                events::LIFECYCLE_CHANNEL,
                events::EVENT_RUN_FAILED,
                json!({
                    "runId": ctx.run_id,
                    "graphId": graph.id,
                    "nodeId": node_id,
                    "error": error.to_string(),
                }),
                ctx,
            )
            .await;

        Ok(RunReport {
            run_id: ctx.run_id.clone(),
            graph_id: graph.id.clone(),
            status: RunStatus::Failed,
            result: None,
            node_reports: reports,
            pending_interaction: None,
            checkpoint_id: None,
            message: Some(message),
            error: Some(error),
        })
    }

    async fn cancel_run(
        &self,
        graph: &Graph,
        emitter: &EventEmitter,
        ctx: &RunContext,
        message: Message,
        reports: Vec<NodeReport>,
        node_id: &str,
    ) -> Result<RunReport> {
        let message = message.transition_to(
            ExecutionState::Cancelled,
            Some("run cancelled".to_string()),
            Some(node_id.to_string()),
        )?;

        self.save_checkpoint(graph, ctx, node_id, &message, None).await?;

        emitter
            .emit(
                events::LIFECYCLE_CHANNEL,
                events::EVENT_RUN_CANCELLED,
                json!({
                    "runId": ctx.run_id,
                    "graphId": graph.id,
                    "nodeId": node_id,
                }),
                ctx,
            )
            .await;

        Ok(RunReport {
            run_id: ctx.run_id.clone(),
            graph_id: graph.id.clone(),
            status: RunStatus::Cancelled,
            result: None,
            node_reports: reports,
            pending_interaction: None,
            checkpoint_id: None,
            message: Some(message),
            error: Some(SpiceError::Cancelled),
        })
    }
}
