//! Runtime lifecycle events
//!
//! The runner narrates runs over the event plane: run lifecycle on
//! `spice.lifecycle`, tool invocations on `spice.tool`, and HITL prompts on
//! `spice.hitl`. Emission is best-effort - a bus failure is logged, never
//! fatal to the run.

use crate::context::RunContext;
use spice_events::{Channel, EventBus, EventMetadata, SchemaRegistry};
use std::sync::Arc;

/// Channel carrying run/node lifecycle events.
pub const LIFECYCLE_CHANNEL: &str = "spice.lifecycle";
/// Channel carrying tool-call events.
pub const TOOL_CHANNEL: &str = "spice.tool";
/// Channel carrying human-interaction prompts.
pub const HITL_CHANNEL: &str = "spice.hitl";

pub const EVENT_RUN_STARTED: &str = "spice.run.started";
pub const EVENT_RUN_COMPLETED: &str = "spice.run.completed";
pub const EVENT_RUN_FAILED: &str = "spice.run.failed";
pub const EVENT_RUN_PAUSED: &str = "spice.run.paused";
pub const EVENT_RUN_RESUMED: &str = "spice.run.resumed";
pub const EVENT_RUN_CANCELLED: &str = "spice.run.cancelled";
pub const EVENT_NODE_COMPLETED: &str = "spice.node.completed";
pub const EVENT_TOOL_CALLED: &str = "spice.tool.called";
pub const EVENT_HITL_PROMPT: &str = "spice.hitl.prompt";

/// Schema version of all runtime events.
pub const RUNTIME_SCHEMA_VERSION: u32 = 1;

const ALL_EVENT_TYPES: &[&str] = &[
    EVENT_RUN_STARTED,
    EVENT_RUN_COMPLETED,
    EVENT_RUN_FAILED,
    EVENT_RUN_PAUSED,
    EVENT_RUN_RESUMED,
    EVENT_RUN_CANCELLED,
    EVENT_NODE_COMPLETED,
    EVENT_TOOL_CALLED,
    EVENT_HITL_PROMPT,
];

/// Register the runtime's event schemas (idempotent)
pub fn register_runtime_schemas(registry: &SchemaRegistry) {
    for event_type in ALL_EVENT_TYPES {
        registry.register_json(*event_type, RUNTIME_SCHEMA_VERSION);
    }
}

/// Best-effort publisher of runtime events
#[derive(Clone, Default)]
pub struct EventEmitter {
    bus: Option<Arc<dyn EventBus>>,
}

impl EventEmitter {
    pub fn new(bus: Option<Arc<dyn EventBus>>) -> Self {
        Self { bus }
    }

    /// Publish to a runtime channel; failures are logged and swallowed
    pub async fn emit(
        &self,
        channel_name: &str,
        event_type: &str,
        payload: serde_json::Value,
        ctx: &RunContext,
    ) {
        let Some(bus) = &self.bus else {
            return;
        };
        let channel = Channel::new(channel_name, event_type, RUNTIME_SCHEMA_VERSION);
        let mut metadata = EventMetadata::new().with_partition_key(ctx.run_id.clone());
        if let Some(tenant) = ctx.tenant_id() {
            metadata = metadata.with_tenant_id(tenant);
        }
        if let Some(user) = ctx.user_id() {
            metadata = metadata.with_user_id(user);
        }
        if let Some(trace) = ctx.trace_id() {
            metadata = metadata.with_trace_id(trace);
        }

        if let Err(e) = bus.publish(&channel, payload, metadata).await {
            tracing::warn!(
                run_id = %ctx.run_id,
                event_type,
                error = %e,
                "Failed to publish runtime event"
            );
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("has_bus", &self.bus.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use spice_events::{InMemoryEventBus, SubscriptionFilter};

    #[tokio::test]
    async fn test_emit_publishes_with_run_metadata() {
        let bus = InMemoryEventBus::new();
        register_runtime_schemas(bus.registry());
        let bus: Arc<dyn EventBus> = Arc::new(bus.clone());

        let msg = crate::message::Message::new("x", "a")
            .with_metadata(crate::context::KEY_TENANT_ID, "t-1");
        let ctx = crate::context::RunContext::with_run_id("run-1", "g")
            .capture_values(&msg, &[crate::context::KEY_TENANT_ID.to_string()]);

        let emitter = EventEmitter::new(Some(bus.clone()));
        emitter
            .emit(
                LIFECYCLE_CHANNEL,
                EVENT_RUN_STARTED,
                json!({"runId": "run-1"}),
                &ctx,
            )
            .await;

        let channel = Channel::new(LIFECYCLE_CHANNEL, EVENT_RUN_STARTED, RUNTIME_SCHEMA_VERSION);
        let mut stream = bus
            .subscribe(&channel, SubscriptionFilter::all())
            .await
            .unwrap();
        let (envelope, payload) = stream.next().await.unwrap();
        assert_eq!(payload["runId"], "run-1");
        assert_eq!(envelope.metadata.tenant_id.as_deref(), Some("t-1"));
        assert_eq!(envelope.metadata.partition_key.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_emit_without_bus_is_noop() {
        let emitter = EventEmitter::new(None);
        let ctx = crate::context::RunContext::new("g");
        emitter
            .emit(LIFECYCLE_CHANNEL, EVENT_RUN_STARTED, json!({}), &ctx)
            .await;
    }

    #[tokio::test]
    async fn test_emit_swallows_unregistered_schema() {
        // Schemas never registered: publish fails closed, emit logs and
        // returns.
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let emitter = EventEmitter::new(Some(bus));
        let ctx = crate::context::RunContext::new("g");
        emitter
            .emit(LIFECYCLE_CHANNEL, EVENT_RUN_STARTED, json!({}), &ctx)
            .await;
    }
}
