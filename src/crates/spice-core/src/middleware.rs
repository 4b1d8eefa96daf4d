//! Middleware chain around node execution
//!
//! Middleware wraps every node execution (`on_node`) and gets a vote on
//! failures (`on_error`). The chain runs in registration order, outermost
//! first. Error verdicts aggregate with `Propagate` winning over `Skip`
//! winning over `Retry`; middleware that returns no verdict defers to the
//! retry policy's classifier.

use crate::context::RunContext;
use crate::error::{Result, SpiceError};
use crate::message::Message;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// What middleware decides about a node failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Fail now; wins over the retry policy
    Propagate,
    /// Re-invoke the node, consuming the shared attempt budget
    Retry,
    /// Treat the failure as a no-op success
    Skip,
}

/// One node execution as seen by middleware
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub node_id: String,
    pub node_kind: &'static str,
    /// 1-based attempt number
    pub attempt: u32,
    pub message: Message,
    pub ctx: RunContext,
}

/// Failure context handed to `on_error`
#[derive(Debug, Clone)]
pub struct ErrorContext<'a> {
    pub node_id: &'a str,
    pub attempt: u32,
    pub run_id: &'a str,
}

type TerminalFn<'a> = dyn Fn(NodeRequest) -> BoxFuture<'a, Result<Message>> + Send + Sync + 'a;

/// Remainder of the chain below the current middleware
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a TerminalFn<'a>,
}

impl<'a> Next<'a> {
    /// Invoke the rest of the chain (ultimately the node itself)
    pub fn run(self, request: NodeRequest) -> BoxFuture<'a, Result<Message>> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    terminal: self.terminal,
                };
                head.on_node(request, next)
            }
            None => (self.terminal)(request),
        }
    }
}

/// Interceptor around node execution
///
/// `on_node` may mutate the request's view of the message but must not
/// violate state-machine invariants; `on_error` may return a verdict or
/// defer with `None`.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn on_node(&self, request: NodeRequest, next: Next<'_>) -> Result<Message> {
        next.run(request).await
    }

    fn on_error(&self, error: &SpiceError, ctx: &ErrorContext<'_>) -> Option<ErrorAction> {
        let _ = (error, ctx);
        None
    }
}

/// Run a request through the whole chain down to the terminal executor
pub async fn run_chain<'a>(
    middleware: &'a [Arc<dyn Middleware>],
    request: NodeRequest,
    terminal: &'a TerminalFn<'a>,
) -> Result<Message> {
    Next {
        chain: middleware,
        terminal,
    }
    .run(request)
    .await
}

/// Tie a terminal closure's future lifetime to the chain's
///
/// Lets closure inference unify the boxed future's lifetime with the
/// borrows [`run_chain`] sees, so terminals can capture graph state.
pub fn terminal_fn<'a, F>(f: F) -> F
where
    F: Fn(NodeRequest) -> BoxFuture<'a, Result<Message>> + Send + Sync + 'a,
{
    f
}

/// Combine the chain's error verdicts: Propagate > Skip > Retry > defer
pub fn aggregate_error_actions(
    middleware: &[Arc<dyn Middleware>],
    error: &SpiceError,
    ctx: &ErrorContext<'_>,
) -> Option<ErrorAction> {
    let mut verdict: Option<ErrorAction> = None;
    for mw in middleware {
        match mw.on_error(error, ctx) {
            Some(ErrorAction::Propagate) => return Some(ErrorAction::Propagate),
            Some(ErrorAction::Skip) => verdict = Some(ErrorAction::Skip),
            Some(ErrorAction::Retry) => {
                if verdict.is_none() {
                    verdict = Some(ErrorAction::Retry);
                }
            }
            None => {}
        }
    }
    verdict
}

/// Structured-logging middleware: spans node execution with timing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn on_node(&self, request: NodeRequest, next: Next<'_>) -> Result<Message> {
        let node_id = request.node_id.clone();
        let kind = request.node_kind;
        let attempt = request.attempt;
        let run_id = request.ctx.run_id.clone();
        tracing::debug!(%run_id, %node_id, kind, attempt, "Node execution started");

        let started = std::time::Instant::now();
        let result = next.run(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(message) => tracing::info!(
                %run_id,
                %node_id,
                kind,
                attempt,
                duration_ms,
                state = %message.state,
                "Node execution finished"
            ),
            Err(error) => tracing::warn!(
                %run_id,
                %node_id,
                kind,
                attempt,
                duration_ms,
                error = %error,
                "Node execution failed"
            ),
        }
        result
    }
}

/// Copies propagated context values into message metadata
///
/// Ensures tenant/user/trace identifiers captured at run start stay visible
/// to nodes and subgraphs even when an upstream node rebuilt the metadata.
#[derive(Debug, Clone)]
pub struct ContextPropagationMiddleware {
    keys: Vec<String>,
}

impl ContextPropagationMiddleware {
    pub fn new() -> Self {
        Self {
            keys: crate::node::default_preserve_keys(),
        }
    }

    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for ContextPropagationMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for ContextPropagationMiddleware {
    async fn on_node(&self, mut request: NodeRequest, next: Next<'_>) -> Result<Message> {
        for key in &self.keys {
            if request.message.get_metadata(key).is_none() {
                if let Some(value) = request.ctx.value(key) {
                    request.message = request
                        .message
                        .with_metadata(key.clone(), value.to_string());
                }
            }
        }
        next.run(request).await
    }
}

type MessageCheckFn = dyn Fn(&Message) -> Result<()> + Send + Sync;

/// Validates the message before each node executes
pub struct ValidationMiddleware {
    check: Arc<MessageCheckFn>,
}

impl ValidationMiddleware {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn on_node(&self, request: NodeRequest, next: Next<'_>) -> Result<Message> {
        (self.check)(&request.message)?;
        next.run(request).await
    }
}
