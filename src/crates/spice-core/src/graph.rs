//! Graph container and builder
//!
//! A graph is immutable once built and safe to share across runs. The
//! builder validates the whole structure at build time - entry point, edge
//! endpoints, decision branches, strict tool resolution, and (for acyclic
//! graphs) cycle freedom - reporting every problem at once.

use crate::edge::Edge;
use crate::error::{Result, SpiceError};
use crate::middleware::Middleware;
use crate::node::Node;
use crate::retry::ExecutionRetryPolicy;
use crate::tool::{IssueSeverity, ToolRegistry};
use crate::value::Value;
use spice_checkpoint::{CheckpointStore, IdempotencyStore};
use spice_events::EventBus;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Observer of tool executions within a graph
pub trait ToolLifecycleListener: Send + Sync {
    fn on_tool_start(&self, node_id: &str, tool_name: &str, params: &HashMap<String, Value>) {
        let _ = (node_id, tool_name, params);
    }

    fn on_tool_success(&self, node_id: &str, tool_name: &str, duration_ms: u64) {
        let _ = (node_id, tool_name, duration_ms);
    }

    fn on_tool_error(&self, node_id: &str, tool_name: &str, error: &SpiceError) {
        let _ = (node_id, tool_name, error);
    }
}

/// Validated, immutable workflow graph
#[derive(Clone)]
pub struct Graph {
    pub id: String,
    nodes: Vec<Node>,
    node_index: HashMap<String, usize>,
    edges: Vec<Edge>,
    pub entry_point: String,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub allow_cycles: bool,
    /// Graph-level override of the runner's retry policy
    pub retry_policy: Option<ExecutionRetryPolicy>,
    /// `false` forces a single attempt regardless of policy
    pub retry_enabled: bool,
    pub tool_registry: Arc<ToolRegistry>,
    pub event_bus: Option<Arc<dyn EventBus>>,
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    pub idempotency_store: Option<Arc<dyn IdempotencyStore>>,
    pub tool_listeners: Vec<Arc<dyn ToolLifecycleListener>>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|i| &self.nodes[*i])
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges (user-declared first, then decision auto-edges)
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn entry_node(&self) -> &Node {
        self.node(&self.entry_point)
            .expect("entry point validated at build")
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("entry_point", &self.entry_point)
            .field("allow_cycles", &self.allow_cycles)
            .finish()
    }
}

/// Build a validated graph
///
/// ```rust,ignore
/// let graph = build_graph("greeter", |g| {
///     g.add_node(Node::Agent(agent_node));
///     g.add_node(Node::Output(OutputNode::new("out")));
///     g.connect("agent", "out");
///     g.entry("agent");
/// })?;
/// ```
pub fn build_graph<F>(id: impl Into<String>, configure: F) -> Result<Graph>
where
    F: FnOnce(&mut GraphBuilder),
{
    let mut builder = GraphBuilder::new(id);
    configure(&mut builder);
    builder.build()
}

/// Mutable graph under construction
pub struct GraphBuilder {
    id: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entry_point: Option<String>,
    middleware: Vec<Arc<dyn Middleware>>,
    allow_cycles: bool,
    retry_policy: Option<ExecutionRetryPolicy>,
    retry_enabled: bool,
    tool_registry: Arc<ToolRegistry>,
    event_bus: Option<Arc<dyn EventBus>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    idempotency_store: Option<Arc<dyn IdempotencyStore>>,
    tool_listeners: Vec<Arc<dyn ToolLifecycleListener>>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            entry_point: None,
            middleware: Vec::new(),
            allow_cycles: false,
            retry_policy: None,
            retry_enabled: true,
            tool_registry: Arc::new(ToolRegistry::new()),
            event_bus: None,
            checkpoint_store: None,
            idempotency_store: None,
            tool_listeners: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Declare an edge (registration order matters for tie-breaking)
    pub fn edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    /// Shorthand for an unconditional edge
    pub fn connect(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn entry(&mut self, node_id: impl Into<String>) -> &mut Self {
        self.entry_point = Some(node_id.into());
        self
    }

    /// Middleware run outermost-first in registration order
    pub fn with_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    pub fn allow_cycles(&mut self, allow: bool) -> &mut Self {
        self.allow_cycles = allow;
        self
    }

    /// Graph-level retry policy (overrides the runner's)
    pub fn with_retry_policy(&mut self, policy: ExecutionRetryPolicy) -> &mut Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Force single attempts for every node in this graph
    pub fn disable_retry(&mut self) -> &mut Self {
        self.retry_enabled = false;
        self
    }

    pub fn with_tool_registry(&mut self, registry: Arc<ToolRegistry>) -> &mut Self {
        self.tool_registry = registry;
        self
    }

    pub fn with_event_bus(&mut self, bus: Arc<dyn EventBus>) -> &mut Self {
        // The runner's lifecycle events must be publishable on this bus.
        crate::events::register_runtime_schemas(bus.registry());
        self.event_bus = Some(bus);
        self
    }

    pub fn with_checkpoint_store(&mut self, store: Arc<dyn CheckpointStore>) -> &mut Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_idempotency_store(&mut self, store: Arc<dyn IdempotencyStore>) -> &mut Self {
        self.idempotency_store = Some(store);
        self
    }

    pub fn with_tool_listener(&mut self, listener: Arc<dyn ToolLifecycleListener>) -> &mut Self {
        self.tool_listeners.push(listener);
        self
    }

    /// Validate and freeze the graph
    pub fn build(self) -> Result<Graph> {
        let mut errors: Vec<String> = Vec::new();

        // Unique ids, insertion order preserved.
        let mut node_index: HashMap<String, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node_index.insert(node.id().to_string(), i).is_some() {
                errors.push(format!("duplicate node id '{}'", node.id()));
            }
        }

        let entry_point = match &self.entry_point {
            Some(entry) => {
                if !node_index.contains_key(entry) {
                    errors.push(format!("entry point '{}' does not exist", entry));
                }
                entry.clone()
            }
            None => {
                errors.push("no entry point declared".to_string());
                String::new()
            }
        };

        // Decision nodes: branch rules plus auto-generated edges.
        let mut edges = self.edges;
        for node in &self.nodes {
            match node {
                Node::Decision(decision) => {
                    if let Err(e) = decision.validate() {
                        errors.push(e.to_string());
                    }
                    edges.extend(decision.auto_edges());
                }
                Node::EngineDecision(engine) => {
                    if engine.routes.is_empty() && engine.default_target.is_none() {
                        errors.push(format!(
                            "engine decision '{}' declares no routes and no default",
                            engine.id
                        ));
                    }
                    edges.extend(engine.auto_edges());
                }
                Node::Tool(tool) => {
                    for issue in tool.resolver.validate(&self.tool_registry) {
                        match issue.severity {
                            IssueSeverity::Error => errors
                                .push(format!("tool node '{}': {}", tool.id, issue.message)),
                            IssueSeverity::Warning => tracing::warn!(
                                node_id = %tool.id,
                                "{}",
                                issue.message
                            ),
                        }
                    }
                }
                _ => {}
            }
        }

        for edge in &edges {
            if !node_index.contains_key(&edge.from) {
                errors.push(format!("edge source '{}' does not exist", edge.from));
            }
            if !node_index.contains_key(&edge.to) {
                errors.push(format!("edge target '{}' does not exist", edge.to));
            }
        }

        if !self.allow_cycles && errors.is_empty() {
            if let Some(node) = find_cycle(&self.nodes, &edges) {
                errors.push(format!(
                    "graph contains a cycle through '{}' but cycles are disallowed",
                    node
                ));
            }
        }

        if !errors.is_empty() {
            return Err(SpiceError::Validation(format!(
                "graph '{}' failed validation: {}",
                self.id,
                errors.join("; ")
            )));
        }

        Ok(Graph {
            id: self.id,
            nodes: self.nodes,
            node_index,
            edges,
            entry_point,
            middleware: self.middleware,
            allow_cycles: self.allow_cycles,
            retry_policy: self.retry_policy,
            retry_enabled: self.retry_enabled,
            tool_registry: self.tool_registry,
            event_bus: self.event_bus,
            checkpoint_store: self.checkpoint_store,
            idempotency_store: self.idempotency_store,
            tool_listeners: self.tool_listeners,
        })
    }
}

/// Depth-first cycle search over the edge list; returns a node on a cycle
fn find_cycle(nodes: &[Node], edges: &[Edge]) -> Option<String> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<String> {
        if on_stack.contains(node) {
            return Some(node.to_string());
        }
        if !visited.insert(node) {
            return None;
        }
        on_stack.insert(node);
        if let Some(targets) = adjacency.get(node) {
            for target in targets {
                if let Some(found) = visit(target, adjacency, visited, on_stack) {
                    return Some(found);
                }
            }
        }
        on_stack.remove(node);
        None
    }

    for node in nodes {
        if let Some(found) = visit(node.id(), &adjacency, &mut visited, &mut on_stack) {
            return Some(found);
        }
    }
    None
}
