//! Tool-call records carried by messages
//!
//! The shape mirrors the industry-standard function-call structure: an id of
//! the form `call_<24hex>`, a fixed `"function"` type, and a named function
//! with typed arguments. Ordering within a message is preserved.

use crate::value::Value;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// The function invoked by a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

/// One tool call attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// `call_` followed by 24 hex characters
    pub id: String,
    /// Always `"function"`
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a tool call with a freshly generated id
    pub fn new(name: impl Into<String>, arguments: HashMap<String, Value>) -> Self {
        Self::with_id(Self::generate_id(), name, arguments)
    }

    /// Create a tool call with a caller-supplied id
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }

    /// Random `call_<24hex>` id
    pub fn generate_id() -> String {
        let mut rng = rand::thread_rng();
        let mut hex = String::with_capacity(24);
        for _ in 0..24 {
            hex.push(char::from_digit(rng.gen_range(0..16), 16).expect("digit in range"));
        }
        format!("call_{}", hex)
    }

    /// Deterministic `call_<24hex>` id for a human-interaction prompt
    ///
    /// Stable across retries of the same `(run_id, node_id,
    /// invocation_index)` so a re-emitted prompt correlates with the
    /// original response; a loop re-entry bumps the invocation index and
    /// gets a fresh id.
    pub fn stable_id(run_id: &str, node_id: &str, invocation_index: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(run_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(node_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(invocation_index.to_be_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(12).map(|b| format!("{:02x}", b)).collect();
        format!("call_{}", hex)
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.function.arguments.get(key)
    }
}
