//! In-memory event bus
//!
//! Single-process backend with a bounded per-channel replay cache: a
//! subscriber created after N publishes first receives those N envelopes in
//! order, then live events. Payloads that fail deserialization are diverted
//! to the dead-letter queue instead of reaching subscribers.

use crate::bus::{EventBus, EventStream};
use crate::dlq::{DeadLetter, DeadLetterQueue, DlqCallback};
use crate::envelope::{Channel, EventEnvelope, EventMetadata};
use crate::error::Result;
use crate::filter::SubscriptionFilter;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default replay-cache capacity per channel.
const DEFAULT_HISTORY_SIZE: usize = 256;

struct ChannelState {
    history: VecDeque<EventEnvelope>,
    sender: broadcast::Sender<EventEnvelope>,
}

/// In-memory [`EventBus`] implementation with bounded history replay
#[derive(Clone)]
pub struct InMemoryEventBus {
    registry: Arc<SchemaRegistry>,
    channels: Arc<RwLock<HashMap<String, ChannelState>>>,
    history_size: usize,
    dlq: DeadLetterQueue,
}

impl InMemoryEventBus {
    /// Create a bus with a fresh registry and default history size
    pub fn new() -> Self {
        Self::with_registry(Arc::new(SchemaRegistry::new()))
    }

    /// Create a bus sharing an existing schema registry
    pub fn with_registry(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            channels: Arc::new(RwLock::new(HashMap::new())),
            history_size: DEFAULT_HISTORY_SIZE,
            dlq: DeadLetterQueue::new(),
        }
    }

    /// Override the per-channel replay-cache capacity
    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size.max(1);
        self
    }

    /// Shared handle to the registry (for registering schemas after build)
    pub fn registry_arc(&self) -> Arc<SchemaRegistry> {
        self.registry.clone()
    }

    /// Replay-cache snapshot for a channel (oldest first)
    pub fn history(&self, channel_name: &str) -> Vec<EventEnvelope> {
        self.channels
            .read()
            .get(channel_name)
            .map(|state| state.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver a pre-built envelope without codec encoding
    ///
    /// Bridge path for envelopes arriving from another transport; the
    /// payload is delivered as-is and validated only at subscription time.
    pub fn publish_raw(&self, envelope: EventEnvelope) {
        let mut channels = self.channels.write();
        let state = Self::channel_state(&mut channels, &envelope.channel_name, self.history_size);
        while state.history.len() >= self.history_size {
            state.history.pop_front();
        }
        state.history.push_back(envelope.clone());
        // No receivers yet is fine; the history cache covers replay.
        let _ = state.sender.send(envelope);
    }

    fn channel_state<'a>(
        channels: &'a mut HashMap<String, ChannelState>,
        name: &str,
        history_size: usize,
    ) -> &'a mut ChannelState {
        channels.entry(name.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(history_size.max(16) * 4);
            ChannelState {
                history: VecDeque::new(),
                sender,
            }
        })
    }

    fn decode_or_divert(
        registry: &SchemaRegistry,
        dlq: &DeadLetterQueue,
        envelope: EventEnvelope,
    ) -> Option<(EventEnvelope, serde_json::Value)> {
        let codec = match registry.codec_for(&envelope.event_type, envelope.schema_version) {
            Ok(codec) => codec,
            Err(e) => {
                dlq.push(envelope, e.to_string(), 1);
                return None;
            }
        };
        match codec.decode(&envelope.payload) {
            Ok(payload) => Some((envelope, payload)),
            Err(e) => {
                dlq.push(envelope, e.to_string(), 1);
                None
            }
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    async fn publish(
        &self,
        channel: &Channel,
        payload: serde_json::Value,
        metadata: EventMetadata,
    ) -> Result<EventEnvelope> {
        let codec = self
            .registry
            .codec_for(&channel.event_type, channel.schema_version)?;
        let wire = codec.encode(&payload)?;
        let envelope = EventEnvelope::new(channel, wire, metadata);
        self.publish_raw(envelope.clone());
        Ok(envelope)
    }

    async fn subscribe(
        &self,
        channel: &Channel,
        filter: SubscriptionFilter,
    ) -> Result<EventStream> {
        // Snapshot history and open the live receiver under one lock so no
        // event is missed or duplicated at the boundary.
        let (snapshot, mut receiver) = {
            let mut channels = self.channels.write();
            let state = Self::channel_state(&mut channels, &channel.name, self.history_size);
            (
                state.history.iter().cloned().collect::<Vec<_>>(),
                state.sender.subscribe(),
            )
        };

        let registry = self.registry.clone();
        let dlq = self.dlq.clone();
        let stream = async_stream::stream! {
            for envelope in snapshot {
                if !filter.matches(&envelope) {
                    continue;
                }
                if let Some(item) = Self::decode_or_divert(&registry, &dlq, envelope) {
                    yield item;
                }
            }
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if !filter.matches(&envelope) {
                            continue;
                        }
                        if let Some(item) = Self::decode_or_divert(&registry, &dlq, envelope) {
                            yield item;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "In-memory subscriber lagged; events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dlq.entries()
    }

    fn on_dlq_write(&self, callback: DlqCallback) {
        self.dlq.set_callback(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn channel() -> Channel {
        Channel::new("runs", "spice.run.completed", 1)
    }

    fn bus() -> InMemoryEventBus {
        let bus = InMemoryEventBus::new();
        bus.registry().register_json("spice.run.completed", 1);
        bus
    }

    #[tokio::test]
    async fn test_publish_requires_registered_schema() {
        let bus = InMemoryEventBus::new();
        let err = bus
            .publish(&channel(), json!({}), EventMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::EventBusError::SchemaNotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_history_then_live() {
        let bus = bus();
        for i in 0..3 {
            bus.publish(&channel(), json!({"seq": i}), EventMetadata::new())
                .await
                .unwrap();
        }

        let mut stream = bus
            .subscribe(&channel(), SubscriptionFilter::all())
            .await
            .unwrap();

        for i in 0..3 {
            let (_, payload) = stream.next().await.unwrap();
            assert_eq!(payload["seq"], json!(i));
        }

        bus.publish(&channel(), json!({"seq": 3}), EventMetadata::new())
            .await
            .unwrap();
        let (_, payload) = stream.next().await.unwrap();
        assert_eq!(payload["seq"], json!(3));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = bus().with_history_size(2);
        for i in 0..5 {
            bus.publish(&channel(), json!({"seq": i}), EventMetadata::new())
                .await
                .unwrap();
        }

        let history = bus.history("runs");
        assert_eq!(history.len(), 2);

        let mut stream = bus
            .subscribe(&channel(), SubscriptionFilter::all())
            .await
            .unwrap();
        let (_, first) = stream.next().await.unwrap();
        assert_eq!(first["seq"], json!(3));
    }

    #[tokio::test]
    async fn test_malformed_payload_goes_to_dlq() {
        let bus = bus();
        let callbacks = Arc::new(AtomicUsize::new(0));
        let seen = callbacks.clone();
        bus.on_dlq_write(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(&channel(), json!({"ok": true}), EventMetadata::new())
            .await
            .unwrap();
        bus.publish_raw(EventEnvelope::new(
            &channel(),
            "{not valid json".to_string(),
            EventMetadata::new(),
        ));

        let mut stream = bus
            .subscribe(&channel(), SubscriptionFilter::all())
            .await
            .unwrap();
        let (_, payload) = stream.next().await.unwrap();
        assert_eq!(payload, json!({"ok": true}));

        assert_eq!(bus.dead_letters().len(), 1);
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_user_filter_narrows_delivery() {
        let bus = bus();
        bus.publish(
            &channel(),
            json!({"seq": 0}),
            EventMetadata::new().with_user_id("u-1"),
        )
        .await
        .unwrap();
        bus.publish(
            &channel(),
            json!({"seq": 1}),
            EventMetadata::new().with_user_id("u-2"),
        )
        .await
        .unwrap();

        let mut stream = bus
            .subscribe(&channel(), SubscriptionFilter::by_user_id("u-2"))
            .await
            .unwrap();
        let (envelope, payload) = stream.next().await.unwrap();
        assert_eq!(envelope.metadata.user_id.as_deref(), Some("u-2"));
        assert_eq!(payload["seq"], json!(1));
    }
}
