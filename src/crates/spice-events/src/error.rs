//! Error types for the event plane

use thiserror::Error;

/// Convenience result type using [`EventBusError`]
pub type Result<T> = std::result::Result<T, EventBusError>;

/// Errors produced by event-bus backends and the schema registry
#[derive(Error, Debug)]
pub enum EventBusError {
    /// Publish attempted on an unregistered `(event_type, schema_version)`
    /// pair; registration is fail-closed
    #[error("Schema not registered: {event_type} v{schema_version}")]
    SchemaNotRegistered {
        event_type: String,
        schema_version: u32,
    },

    /// Payload could not be encoded for the wire
    #[error("Payload encoding failed: {0}")]
    Encode(String),

    /// Payload could not be decoded from the wire
    #[error("Payload decoding failed: {0}")]
    Decode(String),

    /// Referenced stream/topic does not exist
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// Referenced consumer group does not exist on the stream
    #[error("Unknown consumer group '{group}' on stream '{stream}'")]
    UnknownGroup { stream: String, group: String },

    /// Backend-specific storage failure
    #[error("Event storage error: {0}")]
    Storage(String),
}
