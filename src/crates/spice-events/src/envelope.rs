//! Event envelope and channel descriptor
//!
//! An envelope is the wire unit of the event plane: an identified, typed,
//! serialized payload plus routing metadata. Envelopes are owned by the bus
//! until acked; the dead-letter queue takes ownership on unrecoverable
//! failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel descriptor: where events go and what flows through
///
/// Publishing on a channel requires `(event_type, schema_version)` to be
/// registered in the bus's [`SchemaRegistry`](crate::SchemaRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    /// Channel (stream/topic) name
    pub name: String,
    /// Fully-qualified event type, e.g. `"spice.run.completed"`
    pub event_type: String,
    /// Registered schema version of the payload
    pub schema_version: u32,
}

impl Channel {
    pub fn new(name: impl Into<String>, event_type: impl Into<String>, schema_version: u32) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            schema_version,
        }
    }
}

/// Routing and tracing metadata attached to an envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Key used by partitioned backends to pick a partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_tenant_id(mut self, id: impl Into<String>) -> Self {
        self.tenant_id = Some(id.into());
        self
    }

    pub fn with_trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Look up a metadata field by its wire name
    ///
    /// Supports `userId`, `tenantId`, `traceId`, and `partitionKey`; used
    /// by include/exclude subscription filters.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "userId" => self.user_id.as_deref(),
            "tenantId" => self.tenant_id.as_deref(),
            "traceId" => self.trace_id.as_deref(),
            "partitionKey" => self.partition_key.as_deref(),
            _ => None,
        }
    }
}

/// Immutable wire envelope flowing through a bus backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique envelope id
    pub id: String,
    /// Channel name the envelope was published on
    pub channel_name: String,
    /// Fully-qualified event type
    pub event_type: String,
    /// Schema version the payload was encoded with
    pub schema_version: u32,
    /// Serialized payload (codec output)
    pub payload: String,
    /// Routing and tracing metadata
    pub metadata: EventMetadata,
}

impl EventEnvelope {
    /// Build an envelope for a channel, stamping id and timestamp
    pub fn new(channel: &Channel, payload: String, mut metadata: EventMetadata) -> Self {
        if metadata.timestamp.is_none() {
            metadata.timestamp = Some(Utc::now());
        }
        Self {
            id: Uuid::new_v4().to_string(),
            channel_name: channel.name.clone(),
            event_type: channel.event_type.clone(),
            schema_version: channel.schema_version,
            payload,
            metadata,
        }
    }
}
