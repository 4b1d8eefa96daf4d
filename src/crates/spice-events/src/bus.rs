//! The [`EventBus`] trait - the pluggable transport seam
//!
//! Backends differ in delivery mechanics (replay cache, consumer groups,
//! partitions) but expose the same contract: schema-checked publish,
//! independent cold-stream subscriptions, and a dead-letter queue for
//! events that cannot be delivered.

use crate::dlq::{DeadLetter, DlqCallback};
use crate::envelope::{Channel, EventEnvelope, EventMetadata};
use crate::error::Result;
use crate::filter::SubscriptionFilter;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// Async stream of `(envelope, deserialized payload)` pairs
pub type EventStream =
    Pin<Box<dyn Stream<Item = (EventEnvelope, serde_json::Value)> + Send + 'static>>;

/// Typed pub/sub transport
///
/// Publishing is safe from multiple producers. Each `subscribe` call yields
/// an independent stream; backends guarantee ordering per channel (or per
/// partition) only - never globally.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// The schema registry publishes are validated against
    fn registry(&self) -> &SchemaRegistry;

    /// Encode `payload` with the channel's registered codec and deliver it
    ///
    /// Fails closed with
    /// [`SchemaNotRegistered`](crate::EventBusError::SchemaNotRegistered)
    /// when the channel's `(event_type, schema_version)` pair is unknown.
    async fn publish(
        &self,
        channel: &Channel,
        payload: serde_json::Value,
        metadata: EventMetadata,
    ) -> Result<EventEnvelope>;

    /// Open a filtered subscription on a channel
    async fn subscribe(&self, channel: &Channel, filter: SubscriptionFilter)
        -> Result<EventStream>;

    /// Snapshot of the dead-letter queue
    fn dead_letters(&self) -> Vec<DeadLetter>;

    /// Install the synchronous DLQ write callback
    fn on_dlq_write(&self, callback: DlqCallback);
}
