//! Tools and tool resolution
//!
//! A [`Tool`] is a named async operation over typed arguments. Tools live in
//! a [`ToolRegistry`] - read-mostly, populated at startup and explicitly
//! injected into graphs (no global registry). Tool nodes reference tools
//! through a [`ToolResolver`], either fixed by name or resolved dynamically
//! at runtime from the message.

use crate::error::{Result, SpiceError};
use crate::message::Message;
use crate::value::Value;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

type ToolExecutorFn =
    dyn Fn(HashMap<String, Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A named, async, side-effecting operation
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    schema: serde_json::Value,
    executor: Arc<ToolExecutorFn>,
}

impl Tool {
    /// Create a tool from an async executor closure
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, executor: F) -> Self
    where
        F: Fn(HashMap<String, Value>) -> BoxFuture<'static, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({"type": "object"}),
            executor: Arc::new(executor),
        }
    }

    /// Attach a JSON schema describing the tool's parameters
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schema(&self) -> &serde_json::Value {
        &self.schema
    }

    /// Execute the tool with the given arguments
    pub async fn execute(&self, args: HashMap<String, Value>) -> Result<Value> {
        (self.executor)(args).await
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Registry of tools available to a graph
///
/// Read-mostly: populate during startup, then share via `Arc`. Runtime
/// mutation requires external synchronization.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Severity of a build-time resolver finding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Fails graph validation
    Error,
    /// Logged, but the graph still builds
    Warning,
}

/// Build-time finding from resolver validation
#[derive(Debug, Clone)]
pub struct ResolverIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

type ToolSelectorFn = dyn Fn(&Message) -> String + Send + Sync;

/// How a tool node picks its tool
#[derive(Clone)]
pub enum ToolResolver {
    /// Static reference to one tool by name
    Fixed(String),
    /// Runtime selection: a function of the message names the tool
    ByName {
        selector: Arc<ToolSelectorFn>,
        /// When non-empty, the selected name must be in this set
        allowed: Vec<String>,
        /// Strict resolvers fail graph validation on missing tools
        strict: bool,
    },
    /// First registered name in the chain wins
    FallbackChain { names: Vec<String>, strict: bool },
}

impl ToolResolver {
    /// Dynamic resolver from a selector function
    pub fn by_name<F>(selector: F) -> Self
    where
        F: Fn(&Message) -> String + Send + Sync + 'static,
    {
        Self::ByName {
            selector: Arc::new(selector),
            allowed: Vec::new(),
            strict: true,
        }
    }

    /// Restrict a dynamic resolver to an allowed set
    pub fn with_allowed<I, S>(self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self {
            Self::ByName {
                selector, strict, ..
            } => Self::ByName {
                selector,
                allowed: allowed.into_iter().map(Into::into).collect(),
                strict,
            },
            other => other,
        }
    }

    /// Toggle strictness of a dynamic resolver
    pub fn with_strict(self, strict: bool) -> Self {
        match self {
            Self::ByName { selector, allowed, .. } => Self::ByName {
                selector,
                allowed,
                strict,
            },
            Self::FallbackChain { names, .. } => Self::FallbackChain { names, strict },
            fixed => fixed,
        }
    }

    /// Validate the resolver against a registry at graph build
    pub fn validate(&self, registry: &ToolRegistry) -> Vec<ResolverIssue> {
        let missing_issue = |name: &str, strict: bool| ResolverIssue {
            severity: if strict {
                IssueSeverity::Error
            } else {
                IssueSeverity::Warning
            },
            message: format!("tool '{}' is not registered", name),
        };

        match self {
            // A fixed reference is always strict.
            Self::Fixed(name) => {
                if registry.contains(name) {
                    Vec::new()
                } else {
                    vec![missing_issue(name, true)]
                }
            }
            Self::ByName { allowed, strict, .. } => allowed
                .iter()
                .filter(|name| !registry.contains(name))
                .map(|name| missing_issue(name, *strict))
                .collect(),
            Self::FallbackChain { names, strict } => {
                if names.iter().any(|name| registry.contains(name)) {
                    Vec::new()
                } else {
                    vec![ResolverIssue {
                        severity: if *strict {
                            IssueSeverity::Error
                        } else {
                            IssueSeverity::Warning
                        },
                        message: format!(
                            "no tool in fallback chain [{}] is registered",
                            names.join(", ")
                        ),
                    }]
                }
            }
        }
    }

    /// Resolve at runtime; a miss is a non-retryable error
    pub fn resolve(&self, registry: &ToolRegistry, message: &Message) -> Result<Arc<Tool>> {
        match self {
            Self::Fixed(name) => registry
                .get(name)
                .ok_or_else(|| SpiceError::ResolverMissing { tool: name.clone() }),
            Self::ByName {
                selector, allowed, ..
            } => {
                let name = selector(message);
                if !allowed.is_empty() && !allowed.iter().any(|a| a == &name) {
                    return Err(SpiceError::Validation(format!(
                        "tool '{}' is not in the resolver's allowed set",
                        name
                    )));
                }
                registry
                    .get(&name)
                    .ok_or(SpiceError::ResolverMissing { tool: name })
            }
            Self::FallbackChain { names, .. } => names
                .iter()
                .find_map(|name| registry.get(name))
                .ok_or_else(|| SpiceError::ResolverMissing {
                    tool: names.last().cloned().unwrap_or_default(),
                }),
        }
    }
}

impl std::fmt::Debug for ToolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(name) => f.debug_tuple("Fixed").field(name).finish(),
            Self::ByName { allowed, strict, .. } => f
                .debug_struct("ByName")
                .field("allowed", allowed)
                .field("strict", strict)
                .finish(),
            Self::FallbackChain { names, strict } => f
                .debug_struct("FallbackChain")
                .field("names", names)
                .field("strict", strict)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_tool(name: &str) -> Tool {
        Tool::new(name, "echoes its input", |args| {
            Box::pin(async move { Ok(Value::Map(args)) })
        })
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("echo"));
        registry.register(echo_tool("upper"));
        registry
    }

    #[tokio::test]
    async fn test_tool_execution() {
        let tool = echo_tool("echo");
        let out = tool
            .execute([("k".to_string(), Value::Int(1))].into())
            .await
            .unwrap();
        assert_eq!(out.get_key("k"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_fixed_resolver_validation() {
        let registry = registry();
        assert!(ToolResolver::Fixed("echo".into()).validate(&registry).is_empty());

        let issues = ToolResolver::Fixed("missing".into()).validate(&registry);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Error);
    }

    #[test]
    fn test_strict_dynamic_resolver_flags_missing_as_error() {
        let registry = registry();
        let resolver = ToolResolver::by_name(|_| "echo".to_string())
            .with_allowed(["echo", "missing"]);

        let issues = resolver.validate(&registry);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Error);

        let lenient = resolver.with_strict(false);
        let issues = lenient.validate(&registry);
        assert_eq!(issues[0].severity, IssueSeverity::Warning);
    }

    #[test]
    fn test_runtime_resolution() {
        let registry = registry();
        let msg = Message::new("x", "a").with_data("tool", "upper");

        let resolver = ToolResolver::by_name(|m| {
            m.get_data_str("tool").unwrap_or("echo").to_string()
        });
        let tool = resolver.resolve(&registry, &msg).unwrap();
        assert_eq!(tool.name(), "upper");
    }

    #[test]
    fn test_runtime_miss_is_non_retryable() {
        let registry = registry();
        let msg = Message::new("x", "a");
        let resolver = ToolResolver::by_name(|_| "absent".to_string());

        let err = resolver.resolve(&registry, &msg).unwrap_err();
        assert!(matches!(err, SpiceError::ResolverMissing { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_allowed_set_enforced_at_runtime() {
        let registry = registry();
        let msg = Message::new("x", "a");
        let resolver =
            ToolResolver::by_name(|_| "upper".to_string()).with_allowed(["echo"]);

        let err = resolver.resolve(&registry, &msg).unwrap_err();
        assert!(matches!(err, SpiceError::Validation(_)));
    }

    #[test]
    fn test_fallback_chain_picks_first_registered() {
        let registry = registry();
        let msg = Message::new("x", "a");
        let resolver = ToolResolver::FallbackChain {
            names: vec!["absent".into(), "upper".into(), "echo".into()],
            strict: true,
        };
        assert_eq!(resolver.resolve(&registry, &msg).unwrap().name(), "upper");

        let none = ToolResolver::FallbackChain {
            names: vec!["a".into(), "b".into()],
            strict: true,
        };
        assert_eq!(none.validate(&registry).len(), 1);
        assert!(none.resolve(&registry, &msg).is_err());
    }
}
