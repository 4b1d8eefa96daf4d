//! Partitioned-log event bus
//!
//! Topics are split into a fixed number of partitions; an envelope lands on
//! `hash(partition_key) % partitions` (falling back to the envelope id when
//! no key is set). Consumer groups track per-partition offsets, initialized
//! from `auto_offset_reset` on first poll, and delivery is poll-based.
//! Ordering holds within a partition only.

use crate::bus::{EventBus, EventStream};
use crate::dlq::{DeadLetter, DeadLetterQueue, DlqCallback};
use crate::envelope::{Channel, EventEnvelope, EventMetadata};
use crate::error::Result;
use crate::filter::SubscriptionFilter;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// From the first retained record
    Earliest,
    /// Only records appended after the group's first poll
    Latest,
}

/// Tuning for a [`PartitionedLogBus`]
#[derive(Debug, Clone)]
pub struct PartitionedLogConfig {
    /// Partitions per topic
    pub partitions: usize,
    /// Offset initialization for new groups
    pub auto_offset_reset: OffsetReset,
    /// How long a blocking poll waits for records
    pub poll_timeout: Duration,
    /// Maximum records returned per poll
    pub max_poll_records: usize,
}

impl Default for PartitionedLogConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            auto_offset_reset: OffsetReset::Earliest,
            poll_timeout: Duration::from_millis(100),
            max_poll_records: 32,
        }
    }
}

/// One record returned from a poll
#[derive(Debug, Clone)]
pub struct PolledRecord {
    pub partition: usize,
    pub offset: usize,
    pub envelope: EventEnvelope,
}

struct TopicState {
    partitions: Vec<Vec<EventEnvelope>>,
    /// group -> per-partition committed offsets
    groups: HashMap<String, Vec<usize>>,
}

impl TopicState {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions],
            groups: HashMap::new(),
        }
    }
}

/// Partitioned-log [`EventBus`] backend
#[derive(Clone)]
pub struct PartitionedLogBus {
    registry: Arc<SchemaRegistry>,
    topics: Arc<Mutex<HashMap<String, TopicState>>>,
    notify: Arc<Notify>,
    config: PartitionedLogConfig,
    dlq: DeadLetterQueue,
}

impl PartitionedLogBus {
    pub fn new(config: PartitionedLogConfig) -> Self {
        Self::with_registry(Arc::new(SchemaRegistry::new()), config)
    }

    pub fn with_registry(registry: Arc<SchemaRegistry>, config: PartitionedLogConfig) -> Self {
        Self {
            registry,
            topics: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            config,
            dlq: DeadLetterQueue::new(),
        }
    }

    /// Shared handle to the registry
    pub fn registry_arc(&self) -> Arc<SchemaRegistry> {
        self.registry.clone()
    }

    fn partition_for(&self, envelope: &EventEnvelope) -> usize {
        let key = envelope
            .metadata
            .partition_key
            .as_deref()
            .unwrap_or(&envelope.id);
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.config.partitions
    }

    /// Append an envelope, returning `(partition, offset)`
    pub fn append(&self, topic: &str, envelope: EventEnvelope) -> (usize, usize) {
        let partition = self.partition_for(&envelope);
        let offset = {
            let mut topics = self.topics.lock();
            let state = topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicState::new(self.config.partitions));
            state.partitions[partition].push(envelope);
            state.partitions[partition].len() - 1
        };
        self.notify.notify_waiters();
        (partition, offset)
    }

    /// Poll records for a group, blocking up to `poll_timeout` when empty
    ///
    /// Offsets auto-commit as records are returned: a record handed out is
    /// never polled again by the same group.
    pub async fn poll(&self, topic: &str, group: &str) -> Vec<PolledRecord> {
        let deadline = tokio::time::Instant::now() + self.config.poll_timeout;
        loop {
            let notified = self.notify.notified();
            let records = self.poll_now(topic, group);
            if !records.is_empty() {
                return records;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }

    fn poll_now(&self, topic: &str, group: &str) -> Vec<PolledRecord> {
        let mut topics = self.topics.lock();
        let partitions = self.config.partitions;
        let reset = self.config.auto_offset_reset;
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(partitions));

        if !state.groups.contains_key(group) {
            let offsets = match reset {
                OffsetReset::Earliest => vec![0; partitions],
                OffsetReset::Latest => state.partitions.iter().map(Vec::len).collect(),
            };
            state.groups.insert(group.to_string(), offsets);
        }
        let offsets = state.groups.get_mut(group).expect("group just inserted");

        let mut records = Vec::new();
        for partition in 0..partitions {
            while offsets[partition] < state.partitions[partition].len() {
                if records.len() >= self.config.max_poll_records {
                    return records;
                }
                let offset = offsets[partition];
                records.push(PolledRecord {
                    partition,
                    offset,
                    envelope: state.partitions[partition][offset].clone(),
                });
                offsets[partition] += 1;
            }
        }
        records
    }

    /// Committed offsets for a group (one per partition)
    pub fn committed_offsets(&self, topic: &str, group: &str) -> Option<Vec<usize>> {
        self.topics
            .lock()
            .get(topic)
            .and_then(|state| state.groups.get(group).cloned())
    }

    /// Rewind or advance a group's offset on one partition
    pub fn seek(&self, topic: &str, group: &str, partition: usize, offset: usize) {
        let mut topics = self.topics.lock();
        if let Some(state) = topics.get_mut(topic) {
            if let Some(offsets) = state.groups.get_mut(group) {
                if partition < offsets.len() {
                    offsets[partition] = offset;
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for PartitionedLogBus {
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
        self.append(&channel.name, envelope.clone());
        Ok(envelope)
    }

    async fn subscribe(
        &self,
        channel: &Channel,
        filter: SubscriptionFilter,
    ) -> Result<EventStream> {
        let group = format!("sub-{}", Uuid::new_v4());
        let bus = self.clone();
        let topic = channel.name.clone();

        let stream = async_stream::stream! {
            loop {
                for record in bus.poll(&topic, &group).await {
                    let envelope = record.envelope;
                    if !filter.matches(&envelope) {
                        continue;
                    }
                    let codec = match bus
                        .registry
                        .codec_for(&envelope.event_type, envelope.schema_version)
                    {
                        Ok(codec) => codec,
                        Err(e) => {
                            bus.dlq.push(envelope, e.to_string(), 1);
                            continue;
                        }
                    };
                    match codec.decode(&envelope.payload) {
                        Ok(payload) => yield (envelope, payload),
                        // Offsets auto-commit, so a bad record is passed
                        // over exactly once and dead-lettered.
                        Err(e) => bus.dlq.push(envelope, e.to_string(), 1),
                    }
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
    use serde_json::json;

    fn channel() -> Channel {
        Channel::new("orders", "spice.order.created", 1)
    }

    fn bus(config: PartitionedLogConfig) -> PartitionedLogBus {
        let bus = PartitionedLogBus::new(config);
        bus.registry().register_json("spice.order.created", 1);
        bus
    }

    #[tokio::test]
    async fn test_same_key_lands_on_same_partition() {
        let bus = bus(PartitionedLogConfig::default());
        let mut partitions = Vec::new();
        for i in 0..4 {
            let env = bus
                .publish(
                    &channel(),
                    json!({"seq": i}),
                    EventMetadata::new().with_partition_key("tenant-7"),
                )
                .await
                .unwrap();
            partitions.push(bus.partition_for(&env));
        }
        assert!(partitions.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_poll_preserves_per_partition_order() {
        let bus = bus(PartitionedLogConfig {
            poll_timeout: Duration::from_millis(10),
            ..PartitionedLogConfig::default()
        });
        for i in 0..5 {
            bus.publish(
                &channel(),
                json!({"seq": i}),
                EventMetadata::new().with_partition_key("k"),
            )
            .await
            .unwrap();
        }

        let records = bus.poll("orders", "g").await;
        assert_eq!(records.len(), 5);
        let seqs: Vec<usize> = records.iter().map(|r| r.offset).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

        // Offsets committed; nothing left to poll.
        assert!(bus.poll("orders", "g").await.is_empty());
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let bus = bus(PartitionedLogConfig {
            auto_offset_reset: OffsetReset::Latest,
            poll_timeout: Duration::from_millis(10),
            ..PartitionedLogConfig::default()
        });
        bus.publish(&channel(), json!({"seq": 0}), EventMetadata::new())
            .await
            .unwrap();

        assert!(bus.poll("orders", "g").await.is_empty());

        bus.publish(&channel(), json!({"seq": 1}), EventMetadata::new())
            .await
            .unwrap();
        let records = bus.poll("orders", "g").await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_independent_groups_see_all_records() {
        let bus = bus(PartitionedLogConfig {
            poll_timeout: Duration::from_millis(10),
            ..PartitionedLogConfig::default()
        });
        for i in 0..3 {
            bus.publish(&channel(), json!({"seq": i}), EventMetadata::new())
                .await
                .unwrap();
        }

        assert_eq!(bus.poll("orders", "g1").await.len(), 3);
        assert_eq!(bus.poll("orders", "g2").await.len(), 3);
    }

    #[tokio::test]
    async fn test_seek_rewinds_a_partition() {
        let bus = bus(PartitionedLogConfig {
            partitions: 1,
            poll_timeout: Duration::from_millis(10),
            ..PartitionedLogConfig::default()
        });
        for i in 0..3 {
            bus.publish(&channel(), json!({"seq": i}), EventMetadata::new())
                .await
                .unwrap();
        }
        assert_eq!(bus.poll("orders", "g").await.len(), 3);

        bus.seek("orders", "g", 0, 1);
        assert_eq!(bus.poll("orders", "g").await.len(), 2);
    }
}
