//! Node kinds
//!
//! Nodes are the execution units of a graph, modeled as a tagged variant
//! with a common id - new kinds are added as variants, not subclasses. The
//! runner orchestrates cross-cutting concerns (idempotency, retry,
//! checkpoints, subgraph recursion); the per-kind semantics live here.

use crate::context::RunContext;
use crate::edge::Edge;
use crate::error::{Result, SpiceError};
use crate::message::Message;
use crate::tool::ToolResolver;
use crate::toolcall::ToolCall;
use crate::value::Value;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Data key a decision node writes its chosen branch into.
pub const SELECTED_BRANCH_KEY: &str = "_selectedBranch";
/// Data key an engine-decision node records the engine's result id into.
pub const SELECTED_RESULT_KEY: &str = "_selectedResult";

// ---------------------------------------------------------------------------
// External collaborator contracts
// ---------------------------------------------------------------------------

/// Input view an agent node hands to its agent
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub content: String,
    pub correlation_id: String,
    pub metadata: HashMap<String, Value>,
}

/// What an agent returns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReply {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl AgentReply {
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// An external LLM-backed agent
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    async fn handle(&self, input: AgentInput) -> Result<AgentReply>;
}

/// Routing decision produced by an external decision engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    pub result_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DecisionResult {
    pub fn new(result_id: impl Into<String>) -> Self {
        Self {
            result_id: result_id.into(),
            confidence: None,
            reason: None,
        }
    }
}

/// An external decision engine consulted by engine-decision nodes
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    fn id(&self) -> &str;
    async fn decide(&self, message: &Message) -> Result<DecisionResult>;
}

// ---------------------------------------------------------------------------
// Agent node
// ---------------------------------------------------------------------------

type InputSelectorFn = dyn Fn(&Message) -> String + Send + Sync;

/// Invokes an external agent with a view of the message
#[derive(Clone)]
pub struct AgentNode {
    pub id: String,
    agent: Arc<dyn Agent>,
    input_selector: Option<Arc<InputSelectorFn>>,
}

impl AgentNode {
    pub fn new(id: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            id: id.into(),
            agent,
            input_selector: None,
        }
    }

    /// Derive the agent's input content from the message instead of using
    /// the content verbatim
    pub fn with_input_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&Message) -> String + Send + Sync + 'static,
    {
        self.input_selector = Some(Arc::new(selector));
        self
    }

    /// Content the agent will see for this message
    pub fn input_content(&self, message: &Message) -> String {
        self.input_selector
            .as_ref()
            .map(|s| s(message))
            .unwrap_or_else(|| message.content.clone())
    }

    /// Invoke the agent with the input view of the message
    pub async fn invoke(&self, message: &Message) -> Result<AgentReply> {
        let input = AgentInput {
            content: self.input_content(message),
            correlation_id: message.correlation_id.clone(),
            metadata: message.metadata.clone(),
        };
        self.agent.handle(input).await
    }

    /// Fold a reply into the message
    ///
    /// Attaches returned tool calls, merges returned data, replaces the
    /// content, and preserves the execution state.
    pub fn apply_reply(&self, message: Message, reply: AgentReply) -> Message {
        let mut updated = message
            .with_content(reply.content)
            .with_data_entries(reply.data);
        for call in reply.tool_calls {
            updated = updated.with_tool_call(call);
        }
        updated
    }

    /// Invoke the agent and fold its reply into the message
    pub async fn run(&self, message: Message) -> Result<Message> {
        let reply = self.invoke(&message).await?;
        Ok(self.apply_reply(message, reply))
    }
}

// ---------------------------------------------------------------------------
// Tool node
// ---------------------------------------------------------------------------

type ParamMapperFn = dyn Fn(&Message) -> HashMap<String, Value> + Send + Sync;

/// Executes a tool resolved statically or dynamically
///
/// The runner wraps execution with idempotency and retry; this type owns
/// parameter mapping, resolution, and result merging.
#[derive(Clone)]
pub struct ToolNode {
    pub id: String,
    pub resolver: ToolResolver,
    param_mapper: Option<Arc<ParamMapperFn>>,
}

impl ToolNode {
    /// Static tool reference by name
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resolver: ToolResolver::Fixed(tool_name.into()),
            param_mapper: None,
        }
    }

    /// Dynamic tool reference through a resolver
    pub fn with_resolver(id: impl Into<String>, resolver: ToolResolver) -> Self {
        Self {
            id: id.into(),
            resolver,
            param_mapper: None,
        }
    }

    pub fn with_param_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Message) -> HashMap<String, Value> + Send + Sync + 'static,
    {
        self.param_mapper = Some(Arc::new(mapper));
        self
    }

    /// Tool parameters for this message (empty map without a mapper)
    pub fn map_params(&self, message: &Message) -> HashMap<String, Value> {
        self.param_mapper
            .as_ref()
            .map(|m| m(message))
            .unwrap_or_default()
    }

    /// Merge a tool result into the message
    ///
    /// The result lands in `data` under the node id and a `tool_result`
    /// call is appended for downstream agents.
    pub fn apply_result(&self, message: Message, result: Value) -> Message {
        let call = ToolCall::new(
            "tool_result",
            [
                ("nodeId".to_string(), Value::String(self.id.clone())),
                ("result".to_string(), result.clone()),
            ]
            .into(),
        );
        message.with_data(self.id.clone(), result).with_tool_call(call)
    }
}

// ---------------------------------------------------------------------------
// Decision node (inline)
// ---------------------------------------------------------------------------

type BranchPredicateFn = dyn Fn(&Message) -> bool + Send + Sync;

/// One `(name, target, predicate)` entry of an inline decision
#[derive(Clone)]
pub struct Branch {
    pub name: String,
    pub target: String,
    pub is_otherwise: bool,
    predicate: Arc<BranchPredicateFn>,
}

impl Branch {
    pub fn new<F>(name: impl Into<String>, target: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            target: target.into(),
            is_otherwise: false,
            predicate: Arc::new(predicate),
        }
    }

    /// Always-true fallback branch; at most one per decision, last-matching
    pub fn otherwise(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            is_otherwise: true,
            predicate: Arc::new(|_| true),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        (self.predicate)(message)
    }
}

/// Inline decision: ordered branches evaluated first-match-wins
#[derive(Clone)]
pub struct DecisionNode {
    pub id: String,
    pub branches: Vec<Branch>,
}

impl DecisionNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            branches: Vec::new(),
        }
    }

    pub fn branch<F>(mut self, name: impl Into<String>, target: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.branches.push(Branch::new(name, target, predicate));
        self
    }

    pub fn otherwise(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.branches.push(Branch::otherwise(name, target));
        self
    }

    /// Build-time checks: at most one `otherwise`, and it must come last
    pub fn validate(&self) -> Result<()> {
        let otherwise_count = self.branches.iter().filter(|b| b.is_otherwise).count();
        if otherwise_count > 1 {
            return Err(SpiceError::Validation(format!(
                "decision '{}' declares {} otherwise branches; at most one is allowed",
                self.id, otherwise_count
            )));
        }
        if let Some(pos) = self.branches.iter().position(|b| b.is_otherwise) {
            if pos != self.branches.len() - 1 {
                return Err(SpiceError::Validation(format!(
                    "decision '{}' must declare its otherwise branch last",
                    self.id
                )));
            }
        }
        if self.branches.is_empty() {
            return Err(SpiceError::Validation(format!(
                "decision '{}' declares no branches",
                self.id
            )));
        }
        Ok(())
    }

    /// Evaluate branches in registration order; the first match wins
    pub fn evaluate(&self, message: &Message) -> Option<&Branch> {
        self.branches.iter().find(|b| b.matches(message))
    }

    /// Write the selected-branch marker the auto-generated edges route on
    pub fn run(&self, message: Message) -> Result<Message> {
        let branch = self.evaluate(&message).ok_or_else(|| {
            SpiceError::Validation(format!(
                "decision '{}' matched no branch and has no otherwise",
                self.id
            ))
        })?;
        Ok(message.with_data(SELECTED_BRANCH_KEY, branch.name.clone()))
    }

    /// Edges generated from the branches, tagged by branch name
    pub fn auto_edges(&self) -> Vec<Edge> {
        self.branches
            .iter()
            .enumerate()
            .map(|(i, branch)| {
                let marker = branch.name.clone();
                Edge::new(self.id.clone(), branch.target.clone())
                    .with_name(branch.name.clone())
                    .with_priority(i as i32)
                    .with_condition(move |m: &Message| {
                        m.get_data(SELECTED_BRANCH_KEY).and_then(Value::as_str)
                            == Some(marker.as_str())
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine-decision node
// ---------------------------------------------------------------------------

/// Routes on a `result_id` produced by an external decision engine
#[derive(Clone)]
pub struct EngineDecisionNode {
    pub id: String,
    engine: Arc<dyn DecisionEngine>,
    /// `result_id -> target node` in registration order
    pub routes: Vec<(String, String)>,
    pub default_target: Option<String>,
}

impl EngineDecisionNode {
    pub fn new(id: impl Into<String>, engine: Arc<dyn DecisionEngine>) -> Self {
        Self {
            id: id.into(),
            engine,
            routes: Vec::new(),
            default_target: None,
        }
    }

    pub fn route(mut self, result_id: impl Into<String>, target: impl Into<String>) -> Self {
        self.routes.push((result_id.into(), target.into()));
        self
    }

    /// Target for unrecognized result ids
    pub fn default_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = Some(target.into());
        self
    }

    /// Consult the engine and write routing markers
    pub async fn run(&self, message: Message) -> Result<Message> {
        let result = self.engine.decide(&message).await?;
        let target = self
            .routes
            .iter()
            .find(|(id, _)| id == &result.result_id)
            .map(|(_, target)| target.clone())
            .or_else(|| self.default_target.clone())
            .ok_or_else(|| {
                SpiceError::Validation(format!(
                    "engine decision '{}' has no route for result '{}' and no default",
                    self.id, result.result_id
                ))
            })?;
        Ok(message
            .with_data(SELECTED_RESULT_KEY, result.result_id)
            .with_data(SELECTED_BRANCH_KEY, target))
    }

    /// Edges generated from the routing table (plus the default)
    pub fn auto_edges(&self) -> Vec<Edge> {
        let mut targets: Vec<String> = Vec::new();
        for (_, target) in &self.routes {
            if !targets.contains(target) {
                targets.push(target.clone());
            }
        }
        if let Some(default) = &self.default_target {
            if !targets.contains(default) {
                targets.push(default.clone());
            }
        }
        targets
            .into_iter()
            .enumerate()
            .map(|(i, target)| {
                let marker = target.clone();
                Edge::new(self.id.clone(), target)
                    .with_priority(i as i32)
                    .with_condition(move |m: &Message| {
                        m.get_data(SELECTED_BRANCH_KEY).and_then(Value::as_str)
                            == Some(marker.as_str())
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Human (HITL) node
// ---------------------------------------------------------------------------

/// Selection mode for a human prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionType {
    Single,
    Multiple,
    FreeText,
}

/// One selectable option of a human prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl PromptOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            metadata: None,
        }
    }
}

/// Descriptor of a pending human interaction, surfaced in run reports,
/// checkpoints, and prompt events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInteraction {
    /// `request_user_selection` or `request_user_input`
    #[serde(rename = "type")]
    pub prompt_type: String,
    pub run_id: String,
    pub node_id: String,
    pub invocation_index: u32,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<PromptOption>,
    pub selection_type: SelectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Stable tool-call id of the prompt
    pub tool_call_id: String,
    /// Present when the pause bubbled up from a subgraph child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_checkpoint_id: Option<String>,
}

impl PendingInteraction {
    /// Wire payload of the prompt event emitted when a run pauses
    pub fn to_event_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("pending interaction serializes")
    }
}

/// Response to a pending interaction (wire shape consumed on resume)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_option_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_text: Option<String>,
}

impl HumanResponse {
    pub fn selection<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selected_option_ids: Some(ids.into_iter().map(Into::into).collect()),
            free_text: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            selected_option_ids: None,
            free_text: Some(text.into()),
        }
    }

    /// Value merged into `data` under the paused node's id
    pub fn to_value(&self, selection_type: SelectionType) -> Value {
        if let Some(text) = &self.free_text {
            return Value::String(text.clone());
        }
        match (&self.selected_option_ids, selection_type) {
            (Some(ids), SelectionType::Multiple) => {
                Value::List(ids.iter().cloned().map(Value::String).collect())
            }
            (Some(ids), _) => ids
                .first()
                .cloned()
                .map(Value::String)
                .unwrap_or(Value::Null),
            (None, _) => Value::Null,
        }
    }
}

/// Pauses the run until a human responds
#[derive(Debug, Clone)]
pub struct HumanNode {
    pub id: String,
    pub prompt: String,
    pub options: Vec<PromptOption>,
    pub selection_type: SelectionType,
    pub timeout: Option<std::time::Duration>,
}

impl HumanNode {
    /// Free-text prompt
    pub fn input(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            options: Vec::new(),
            selection_type: SelectionType::FreeText,
            timeout: None,
        }
    }

    /// Single-choice selection prompt
    pub fn selection(
        id: impl Into<String>,
        prompt: impl Into<String>,
        options: Vec<PromptOption>,
    ) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            options,
            selection_type: SelectionType::Single,
            timeout: None,
        }
    }

    pub fn multiple(mut self) -> Self {
        self.selection_type = SelectionType::Multiple;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn prompt_type(&self) -> &'static str {
        if self.options.is_empty() {
            "request_user_input"
        } else {
            "request_user_selection"
        }
    }

    /// Move the message into WAITING, attaching the prompt tool call
    ///
    /// Claims the next invocation index from the run context so loop
    /// re-entries get fresh prompt ids. The runner persists the checkpoint
    /// and notifies the external emitter out-of-band.
    pub fn run(&self, message: Message, ctx: &RunContext) -> Result<(Message, PendingInteraction)> {
        let invocation_index = ctx.next_invocation_index(&self.id);
        self.run_with_index(message, ctx, invocation_index)
    }

    /// [`run`](Self::run) with a pre-claimed invocation index
    ///
    /// The runner claims the index once per node entry and reuses it across
    /// retry attempts, keeping the prompt's tool-call id stable for the same
    /// `(run_id, node_id, invocation_index)`.
    pub fn run_with_index(
        &self,
        message: Message,
        ctx: &RunContext,
        invocation_index: u32,
    ) -> Result<(Message, PendingInteraction)> {
        let call_id = ToolCall::stable_id(&ctx.run_id, &self.id, invocation_index);

        let mut args: HashMap<String, Value> =
            [("prompt".to_string(), Value::String(self.prompt.clone()))].into();
        if !self.options.is_empty() {
            let items: Vec<Value> = self
                .options
                .iter()
                .map(|o| serde_json::to_value(o).expect("option serializes").into())
                .collect();
            args.insert("items".to_string(), Value::List(items));
            args.insert(
                "selectionType".to_string(),
                Value::String(
                    match self.selection_type {
                        SelectionType::Multiple => "multiple",
                        _ => "single",
                    }
                    .to_string(),
                ),
            );
        }

        let pending = PendingInteraction {
            prompt_type: self.prompt_type().to_string(),
            run_id: ctx.run_id.clone(),
            node_id: self.id.clone(),
            invocation_index,
            prompt: self.prompt.clone(),
            options: self.options.clone(),
            selection_type: self.selection_type,
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            correlation_id: message.correlation_id.clone(),
            tenant_id: ctx.tenant_id().map(String::from),
            user_id: ctx.user_id().map(String::from),
            tool_call_id: call_id.clone(),
            child_checkpoint_id: None,
        };

        let waiting = message
            .transition_to(
                crate::state::ExecutionState::Waiting,
                Some("awaiting human response".to_string()),
                Some(self.id.clone()),
            )?
            .with_tool_call(ToolCall::with_id(call_id, self.prompt_type(), args));

        Ok((waiting, pending))
    }
}

// ---------------------------------------------------------------------------
// Subgraph, output, parallel, custom
// ---------------------------------------------------------------------------

/// Default metadata keys that cross subgraph boundaries in both directions.
pub fn default_preserve_keys() -> Vec<String> {
    vec![
        crate::context::KEY_TENANT_ID.to_string(),
        crate::context::KEY_USER_ID.to_string(),
        crate::context::KEY_CORRELATION_ID.to_string(),
        crate::context::KEY_TRACE_ID.to_string(),
    ]
}

/// Runs a nested graph with bounded depth and key mapping
///
/// Execution is a recursive runner invocation; see the runner for pause
/// propagation and checkpoint namespacing.
#[derive(Clone)]
pub struct SubgraphNode {
    pub id: String,
    pub graph: Arc<crate::graph::Graph>,
    pub max_depth: u32,
    /// Metadata keys that flow parent -> child and back
    pub preserve_keys: Vec<String>,
    /// `child data key <- template over the parent message`
    pub input_mapping: Vec<(String, String)>,
    /// `child data key -> parent data key`
    pub output_mapping: Vec<(String, String)>,
}

impl SubgraphNode {
    pub fn new(id: impl Into<String>, graph: Arc<crate::graph::Graph>) -> Self {
        Self {
            id: id.into(),
            graph,
            max_depth: 10,
            preserve_keys: default_preserve_keys(),
            input_mapping: Vec::new(),
            output_mapping: Vec::new(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_preserve_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preserve_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Map a template over the parent message into a child data key
    pub fn map_input(mut self, child_key: impl Into<String>, template: impl Into<String>) -> Self {
        self.input_mapping.push((child_key.into(), template.into()));
        self
    }

    /// Copy a child data key back into a parent data key after the run
    pub fn map_output(mut self, child_key: impl Into<String>, parent_key: impl Into<String>) -> Self {
        self.output_mapping.push((child_key.into(), parent_key.into()));
        self
    }
}

type OutputSelectorFn = dyn Fn(&Message) -> Value + Send + Sync;

/// Terminal node extracting the run's result from the message
#[derive(Clone)]
pub struct OutputNode {
    pub id: String,
    selector: Arc<OutputSelectorFn>,
}

impl OutputNode {
    /// Output node whose result is the message content
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            selector: Arc::new(|m: &Message| Value::String(m.content.clone())),
        }
    }

    pub fn with_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&Message) -> Value + Send + Sync + 'static,
    {
        self.selector = Arc::new(selector);
        self
    }

    /// Apply the selector to produce the run result
    pub fn select(&self, message: &Message) -> Value {
        (self.selector)(message)
    }
}

type NodeTaskFn = dyn Fn(Message) -> BoxFuture<'static, Result<Message>> + Send + Sync;

/// One named branch of a parallel fan-out
#[derive(Clone)]
pub struct ParallelBranch {
    pub name: String,
    task: Arc<NodeTaskFn>,
}

impl ParallelBranch {
    pub fn new<F>(name: impl Into<String>, task: F) -> Self
    where
        F: Fn(Message) -> BoxFuture<'static, Result<Message>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            task: Arc::new(task),
        }
    }
}

/// Fan-out over named branches, joining results into `data`
///
/// Branches run concurrently against clones of the incoming message; each
/// branch's resulting content is aggregated under
/// `data[node_id][branch_name]`.
#[derive(Clone)]
pub struct ParallelNode {
    pub id: String,
    pub branches: Vec<ParallelBranch>,
}

impl ParallelNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            branches: Vec::new(),
        }
    }

    pub fn branch<F>(mut self, name: impl Into<String>, task: F) -> Self
    where
        F: Fn(Message) -> BoxFuture<'static, Result<Message>> + Send + Sync + 'static,
    {
        self.branches.push(ParallelBranch::new(name, task));
        self
    }

    /// Run all branches concurrently and join into the parent message
    pub async fn run(&self, message: Message) -> Result<Message> {
        let futures: Vec<_> = self
            .branches
            .iter()
            .map(|branch| {
                let task = branch.task.clone();
                let name = branch.name.clone();
                let input = message.clone();
                async move { (name, task(input).await) }
            })
            .collect();

        let mut joined: HashMap<String, Value> = HashMap::new();
        for (name, result) in futures::future::join_all(futures).await {
            let child = result?;
            // A branch that stored data under its own name wins over raw
            // content.
            let value = child
                .get_data(&name)
                .cloned()
                .unwrap_or_else(|| Value::String(child.content.clone()));
            joined.insert(name, value);
        }
        Ok(message.with_data(self.id.clone(), Value::Map(joined)))
    }
}

/// User-defined node over a plain async closure
#[derive(Clone)]
pub struct CustomNode {
    pub id: String,
    handler: Arc<NodeTaskFn>,
}

impl CustomNode {
    pub fn new<F>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> BoxFuture<'static, Result<Message>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            handler: Arc::new(handler),
        }
    }

    pub async fn run(&self, message: Message) -> Result<Message> {
        (self.handler)(message).await
    }
}

// ---------------------------------------------------------------------------
// The tagged variant
// ---------------------------------------------------------------------------

/// A graph node
#[derive(Clone)]
pub enum Node {
    Agent(AgentNode),
    Tool(ToolNode),
    Decision(DecisionNode),
    EngineDecision(EngineDecisionNode),
    Human(HumanNode),
    Subgraph(SubgraphNode),
    Output(OutputNode),
    Parallel(ParallelNode),
    Custom(CustomNode),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Agent(n) => &n.id,
            Node::Tool(n) => &n.id,
            Node::Decision(n) => &n.id,
            Node::EngineDecision(n) => &n.id,
            Node::Human(n) => &n.id,
            Node::Subgraph(n) => &n.id,
            Node::Output(n) => &n.id,
            Node::Parallel(n) => &n.id,
            Node::Custom(n) => &n.id,
        }
    }

    /// Kind tag for logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Agent(_) => "agent",
            Node::Tool(_) => "tool",
            Node::Decision(_) => "decision",
            Node::EngineDecision(_) => "engine_decision",
            Node::Human(_) => "human",
            Node::Subgraph(_) => "subgraph",
            Node::Output(_) => "output",
            Node::Parallel(_) => "parallel",
            Node::Custom(_) => "custom",
        }
    }

    /// Whether the runner wraps this node with idempotency
    ///
    /// Only kinds with external side effects (tools and agents) are
    /// fingerprinted.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Node::Tool(_) | Node::Agent(_))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperAgent;

    #[async_trait]
    impl Agent for UpperAgent {
        fn id(&self) -> &str {
            "upper"
        }

        async fn handle(&self, input: AgentInput) -> Result<AgentReply> {
            Ok(AgentReply::from_content(input.content.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_agent_node_replaces_content_and_preserves_state() {
        let msg = Message::new("hello", "user")
            .transition_to(crate::state::ExecutionState::Running, None, None)
            .unwrap();
        let node = AgentNode::new("a", Arc::new(UpperAgent));

        let out = node.run(msg).await.unwrap();
        assert_eq!(out.content, "HELLO");
        assert_eq!(out.state, crate::state::ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_agent_node_input_selector() {
        let msg = Message::new("ignored", "user").with_data("question", "ping");
        let node = AgentNode::new("a", Arc::new(UpperAgent)).with_input_selector(|m| {
            m.get_data_str("question").unwrap_or_default().to_string()
        });

        let out = node.run(msg).await.unwrap();
        assert_eq!(out.content, "PING");
    }

    #[test]
    fn test_decision_first_match_wins() {
        let decision = DecisionNode::new("route")
            .branch("route.A", "agentA", |m| {
                m.get_data_str("type") == Some("A")
            })
            .branch("route.B", "agentB", |m| {
                m.get_data_str("type") == Some("A") // also matches A, but later
            })
            .otherwise("route.other", "agentC");

        let msg = Message::new("x", "a").with_data("type", "A");
        let out = decision.run(msg).unwrap();
        assert_eq!(out.get_data_str(SELECTED_BRANCH_KEY), Some("route.A"));
    }

    #[test]
    fn test_decision_otherwise_catches_everything() {
        let decision = DecisionNode::new("route")
            .branch("route.A", "agentA", |m| {
                m.get_data_str("type") == Some("A")
            })
            .otherwise("route.other", "agentB");

        let msg = Message::new("x", "a").with_data("type", "Z");
        let out = decision.run(msg).unwrap();
        assert_eq!(out.get_data_str(SELECTED_BRANCH_KEY), Some("route.other"));
    }

    #[test]
    fn test_decision_validation_rejects_double_otherwise() {
        let decision = DecisionNode::new("route")
            .otherwise("a", "x")
            .otherwise("b", "y");
        assert!(decision.validate().is_err());

        let misplaced = DecisionNode::new("route")
            .otherwise("a", "x")
            .branch("b", "y", |_| true);
        assert!(misplaced.validate().is_err());

        let fine = DecisionNode::new("route")
            .branch("b", "y", |_| true)
            .otherwise("a", "x");
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn test_decision_auto_edges_route_on_marker() {
        let decision = DecisionNode::new("route")
            .branch("route.A", "agentA", |_| true)
            .otherwise("route.other", "agentB");
        let edges = decision.auto_edges();
        assert_eq!(edges.len(), 2);

        let selected = Message::new("x", "a").with_data(SELECTED_BRANCH_KEY, "route.A");
        let chosen = crate::edge::select_edge(&edges, "route", &selected).unwrap();
        assert_eq!(chosen.to, "agentA");

        let fallback = Message::new("x", "a").with_data(SELECTED_BRANCH_KEY, "route.other");
        let chosen = crate::edge::select_edge(&edges, "route", &fallback).unwrap();
        assert_eq!(chosen.to, "agentB");
    }

    struct FixedEngine(&'static str);

    #[async_trait]
    impl DecisionEngine for FixedEngine {
        fn id(&self) -> &str {
            "fixed"
        }

        async fn decide(&self, _message: &Message) -> Result<DecisionResult> {
            Ok(DecisionResult::new(self.0))
        }
    }

    #[tokio::test]
    async fn test_engine_decision_routes_on_result_id() {
        let node = EngineDecisionNode::new("gate", Arc::new(FixedEngine("approve")))
            .route("approve", "proceed")
            .route("reject", "stop")
            .default_target("review");

        let out = node.run(Message::new("x", "a")).await.unwrap();
        assert_eq!(out.get_data_str(SELECTED_RESULT_KEY), Some("approve"));
        assert_eq!(out.get_data_str(SELECTED_BRANCH_KEY), Some("proceed"));
    }

    #[tokio::test]
    async fn test_engine_decision_unrecognized_takes_default() {
        let node = EngineDecisionNode::new("gate", Arc::new(FixedEngine("weird")))
            .route("approve", "proceed")
            .default_target("review");

        let out = node.run(Message::new("x", "a")).await.unwrap();
        assert_eq!(out.get_data_str(SELECTED_BRANCH_KEY), Some("review"));
    }

    #[test]
    fn test_human_node_produces_waiting_message() {
        let ctx = RunContext::with_run_id("run-1", "g");
        let node = HumanNode::selection(
            "select",
            "Pick one",
            vec![PromptOption::new("ok", "OK"), PromptOption::new("cancel", "Cancel")],
        );
        let msg = Message::new("x", "a")
            .transition_to(crate::state::ExecutionState::Running, None, None)
            .unwrap();

        let (waiting, pending) = node.run(msg, &ctx).unwrap();
        assert_eq!(waiting.state, crate::state::ExecutionState::Waiting);
        assert_eq!(pending.prompt_type, "request_user_selection");
        assert_eq!(pending.invocation_index, 0);
        assert_eq!(pending.options.len(), 2);

        let call = waiting.find_tool_call("request_user_selection").unwrap();
        assert_eq!(call.id, pending.tool_call_id);
        assert_eq!(call.id, ToolCall::stable_id("run-1", "select", 0));
    }

    #[test]
    fn test_human_node_invocation_index_increments_on_reentry() {
        let ctx = RunContext::with_run_id("run-1", "g");
        let node = HumanNode::input("ask", "Say something");

        let running = Message::new("x", "a")
            .transition_to(crate::state::ExecutionState::Running, None, None)
            .unwrap();
        let (_, first) = node.run(running.clone(), &ctx).unwrap();
        let (_, second) = node.run(running, &ctx).unwrap();

        assert_eq!(first.invocation_index, 0);
        assert_eq!(second.invocation_index, 1);
        assert_ne!(first.tool_call_id, second.tool_call_id);
    }

    #[test]
    fn test_human_response_merge_values() {
        let single = HumanResponse::selection(["ok"]);
        assert_eq!(single.to_value(SelectionType::Single), Value::from("ok"));

        let multiple = HumanResponse::selection(["a", "b"]);
        assert_eq!(
            multiple.to_value(SelectionType::Multiple),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );

        let text = HumanResponse::text("hello");
        assert_eq!(text.to_value(SelectionType::FreeText), Value::from("hello"));

        let empty = HumanResponse::default();
        assert_eq!(empty.to_value(SelectionType::Single), Value::Null);
    }

    #[tokio::test]
    async fn test_parallel_node_joins_branch_results() {
        let node = ParallelNode::new("fan")
            .branch("left", |m: Message| {
                Box::pin(async move { Ok(m.with_content("L")) })
            })
            .branch("right", |m: Message| {
                Box::pin(async move { Ok(m.with_content("R")) })
            });

        let out = node.run(Message::new("x", "a")).await.unwrap();
        let joined = out.get_data("fan").unwrap();
        assert_eq!(joined.get_key("left"), Some(&Value::from("L")));
        assert_eq!(joined.get_key("right"), Some(&Value::from("R")));
    }

    #[test]
    fn test_pending_interaction_event_payload_shape() {
        let pending = PendingInteraction {
            prompt_type: "request_user_selection".to_string(),
            run_id: "run-1".to_string(),
            node_id: "select".to_string(),
            invocation_index: 2,
            prompt: "Pick".to_string(),
            options: vec![PromptOption::new("ok", "OK")],
            selection_type: SelectionType::Single,
            timeout_ms: Some(5000),
            correlation_id: "corr".to_string(),
            tenant_id: Some("t-1".to_string()),
            user_id: None,
            tool_call_id: "call_x".to_string(),
            child_checkpoint_id: None,
        };

        let payload = pending.to_event_payload();
        assert_eq!(payload["type"], "request_user_selection");
        assert_eq!(payload["runId"], "run-1");
        assert_eq!(payload["nodeId"], "select");
        assert_eq!(payload["invocationIndex"], 2);
        assert_eq!(payload["selectionType"], "single");
        assert_eq!(payload["timeoutMs"], 5000);
        assert_eq!(payload["tenantId"], "t-1");
        assert_eq!(payload["options"][0]["id"], "ok");
    }
}
