//! Message envelope
//!
//! The immutable unit flowing through a graph: content, typed data and
//! metadata maps, tool calls, execution state, correlation/causation ids,
//! and the full state-transition history. Every mutator returns a new
//! instance; the message id stays stable across functional updates while
//! `correlation_id` is stable across the whole run.

use crate::error::{Result, SpiceError};
use crate::state::{ExecutionState, StateTransition};
use crate::toolcall::ToolCall;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Immutable message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Stable across a workflow run
    pub correlation_id: String,
    /// Id of the message this one was caused by
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub content: String,
    /// Actor that produced the message
    pub from: String,
    pub state: ExecutionState,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub state_history: Vec<StateTransition>,
}

impl Message {
    /// Create a READY message with a fresh id and correlation id
    pub fn new(content: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            causation_id: None,
            content: content.into(),
            from: from.into(),
            state: ExecutionState::Ready,
            data: HashMap::new(),
            metadata: HashMap::new(),
            tool_calls: Vec::new(),
            state_history: Vec::new(),
        }
    }

    /// Create a READY message from raw user input
    ///
    /// The input is recorded both as the content and as a `user_input` tool
    /// call so downstream agents see a uniform tool-call history.
    pub fn from_user_input(
        text: impl Into<String>,
        actor_id: impl Into<String>,
        metadata: Option<HashMap<String, Value>>,
        correlation_id: Option<String>,
    ) -> Self {
        let text = text.into();
        let mut message = Self::new(text.clone(), actor_id);
        if let Some(metadata) = metadata {
            message.metadata = metadata;
        }
        if let Some(correlation_id) = correlation_id {
            message.correlation_id = correlation_id;
        }
        message.tool_calls.push(ToolCall::new(
            "user_input",
            [("text".to_string(), Value::String(text))].into(),
        ));
        message
    }

    /// Override the correlation id (before the run starts)
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Record the causing message id
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// New instance with the content replaced
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// New instance with one data entry added or replaced
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// New instance with several data entries merged in
    pub fn with_data_entries<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.data
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// New instance with one metadata entry added or replaced
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// New instance with a tool call appended (ordering preserved)
    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    /// Validated state transition, appending a history entry
    ///
    /// Rejects transitions outside the allowed table with
    /// [`SpiceError::InvalidStateTransition`].
    pub fn transition_to(
        mut self,
        to: ExecutionState,
        reason: Option<String>,
        node_id: Option<String>,
    ) -> Result<Self> {
        if !self.state.can_transition_to(to) {
            return Err(SpiceError::InvalidStateTransition {
                from: self.state,
                to,
            });
        }
        self.state_history
            .push(StateTransition::new(self.state, to, reason, node_id));
        self.state = to;
        Ok(self)
    }

    /// Dotted-path lookup into `data`
    ///
    /// A flat key containing literal dots takes precedence over nested
    /// traversal; blank segments and non-map intermediates yield `None`.
    pub fn get_data(&self, path: &str) -> Option<&Value> {
        Self::lookup(&self.data, path)
    }

    /// Dotted-path lookup into `metadata` (same rules as [`get_data`](Self::get_data))
    pub fn get_metadata(&self, path: &str) -> Option<&Value> {
        Self::lookup(&self.metadata, path)
    }

    /// String view of a data value, if present and a string
    pub fn get_data_str(&self, path: &str) -> Option<&str> {
        self.get_data(path).and_then(Value::as_str)
    }

    fn lookup<'a>(map: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
        if let Some(value) = map.get(path) {
            return Some(value);
        }
        let mut segments = path.split('.');
        let first = segments.next()?;
        if first.is_empty() {
            return None;
        }
        let mut current = map.get(first)?;
        for segment in segments {
            if segment.is_empty() {
                return None;
            }
            current = current.get_key(segment)?;
        }
        Some(current)
    }

    /// First tool call invoking the named function
    pub fn find_tool_call(&self, name: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.name() == name)
    }

    /// Most recent state transition, if any
    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.state_history.last()
    }
}
