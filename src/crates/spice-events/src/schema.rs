//! Schema registry - fail-closed `(event_type, schema_version)` -> codec map
//!
//! Every publish resolves its channel's `(event_type, schema_version)` pair
//! through the registry; an unregistered pair is rejected rather than
//! serialized with a guessed format. Schema evolution of user payloads
//! beyond registering a new version is out of scope.

use crate::error::{EventBusError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Payload codec for one registered event schema
pub trait EventCodec: Send + Sync + std::fmt::Debug {
    /// Serialize a payload for the wire
    fn encode(&self, payload: &serde_json::Value) -> Result<String>;
    /// Deserialize a wire payload
    fn decode(&self, raw: &str) -> Result<serde_json::Value>;
}

/// Default codec: compact JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    fn encode(&self, payload: &serde_json::Value) -> Result<String> {
        serde_json::to_string(payload).map_err(|e| EventBusError::Encode(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<serde_json::Value> {
        serde_json::from_str(raw).map_err(|e| EventBusError::Decode(e.to_string()))
    }
}

/// Registry of event schemas known to a bus
///
/// Constructed at startup and shared read-mostly afterwards; registrations
/// under concurrent readers are safe but expected only during init.
#[derive(Default)]
pub struct SchemaRegistry {
    codecs: RwLock<HashMap<(String, u32), Arc<dyn EventCodec>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec for `(event_type, schema_version)`
    ///
    /// Re-registering the same pair replaces the codec.
    pub fn register(
        &self,
        event_type: impl Into<String>,
        schema_version: u32,
        codec: Arc<dyn EventCodec>,
    ) {
        self.codecs
            .write()
            .insert((event_type.into(), schema_version), codec);
    }

    /// Register the default JSON codec for `(event_type, schema_version)`
    pub fn register_json(&self, event_type: impl Into<String>, schema_version: u32) {
        self.register(event_type, schema_version, Arc::new(JsonCodec));
    }

    /// Whether the pair is registered
    pub fn is_registered(&self, event_type: &str, schema_version: u32) -> bool {
        self.codecs
            .read()
            .contains_key(&(event_type.to_string(), schema_version))
    }

    /// Resolve the codec for a pair, failing closed when unregistered
    pub fn codec_for(&self, event_type: &str, schema_version: u32) -> Result<Arc<dyn EventCodec>> {
        self.codecs
            .read()
            .get(&(event_type.to_string(), schema_version))
            .cloned()
            .ok_or_else(|| EventBusError::SchemaNotRegistered {
                event_type: event_type.to_string(),
                schema_version,
            })
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("registered", &self.codecs.read().len())
            .finish()
    }
}
