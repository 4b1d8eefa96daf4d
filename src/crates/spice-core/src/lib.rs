//! spice-core - graph execution engine for agent workflows
//!
//! Workflows are directed graphs of typed nodes (agents, tools, decisions,
//! human pauses, subgraphs) joined by predicate-guarded edges. The runner
//! executes them with at-most-once side effects (idempotency fingerprints),
//! bounded retry with jittered backoff, checkpoint-based pause/resume
//! across process restarts, and a pluggable event plane.
//!
//! ```text
//! ┌────────────┐   edges    ┌────────────┐          ┌────────────┐
//! │ agent node ├───────────>│ tool node  ├─────────>│ output node│
//! └────────────┘            └────────────┘          └────────────┘
//!        ▲                        │ idempotency + retry
//!        │ middleware chain       ▼
//!   GraphRunner ── checkpoints ── stores ── events ── HITL pauses
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use spice_core::{build_graph, GraphRunner, Message, Node, OutputNode};
//!
//! let graph = build_graph("greeter", |g| {
//!     g.add_node(Node::Agent(agent_node));
//!     g.add_node(Node::Output(OutputNode::new("out")));
//!     g.connect("greet", "out");
//!     g.entry("greet");
//! })?;
//!
//! let report = GraphRunner::new()
//!     .run(&graph, Message::from_user_input("hello", "user-1", None, None))
//!     .await?;
//! ```

pub mod context;
pub mod edge;
pub mod error;
pub mod events;
pub mod graph;
pub mod message;
pub mod middleware;
pub mod node;
pub mod report;
pub mod retry;
pub mod runner;
pub mod state;
pub mod template;
pub mod tool;
pub mod toolcall;
pub mod value;

pub use context::RunContext;
pub use edge::{select_edge, Edge};
pub use error::{Result, RetryHint, SpiceError};
pub use graph::{build_graph, Graph, GraphBuilder, ToolLifecycleListener};
pub use message::Message;
pub use middleware::{
    ContextPropagationMiddleware, ErrorAction, LoggingMiddleware, Middleware, NodeRequest,
    ValidationMiddleware,
};
pub use node::{
    Agent, AgentInput, AgentNode, AgentReply, Branch, CustomNode, DecisionEngine, DecisionNode,
    DecisionResult, EngineDecisionNode, HumanNode, HumanResponse, Node, OutputNode, ParallelNode,
    PendingInteraction, PromptOption, SelectionType, SubgraphNode, ToolNode,
};
pub use report::{NodeReport, NodeStatus, RunReport, RunStatus};
pub use retry::{ExecutionRetryPolicy, RetryContext, RetrySupervisor};
pub use runner::{GraphRunner, RunnerConfig};
pub use state::{ExecutionState, StateTransition};
pub use template::{resolve_template, TemplateExpression};
pub use tool::{Tool, ToolRegistry, ToolResolver};
pub use toolcall::{FunctionCall, ToolCall};
pub use value::{canonical_json, Value};
