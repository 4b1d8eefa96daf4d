//! Stream-log event bus
//!
//! Append-only log with consumer-group delivery semantics: each group tracks
//! its last-delivered entry, undelivered-but-unacked entries sit in a
//! pending list per group, idle pending entries can be claimed by another
//! consumer, and entries that exceed `max_retries` deliveries are routed to
//! the dead-letter queue. The log is trimmed approximately to `max_len`.
//!
//! The full group API (`add` / `read_group` / `ack` / `pending` / `claim`)
//! is exposed for explicit consumers; the [`EventBus`] implementation layers
//! a private group per subscription on top of it.

use crate::bus::{EventBus, EventStream};
use crate::dlq::{DeadLetter, DeadLetterQueue, DlqCallback};
use crate::envelope::{Channel, EventEnvelope, EventMetadata};
use crate::error::{EventBusError, Result};
use crate::filter::SubscriptionFilter;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Tuning for a [`StreamLogBus`]
#[derive(Debug, Clone)]
pub struct StreamLogConfig {
    /// Approximate maximum retained entries per stream (`None` = unbounded)
    pub max_len: Option<usize>,
    /// How long a blocking read waits for new entries
    pub block_timeout: Duration,
    /// Maximum entries returned per read
    pub batch_size: usize,
    /// Deliveries attempted before an entry is dead-lettered
    pub max_retries: u32,
}

impl Default for StreamLogConfig {
    fn default() -> Self {
        Self {
            max_len: Some(4096),
            block_timeout: Duration::from_millis(100),
            batch_size: 16,
            max_retries: 3,
        }
    }
}

/// Pending-entry summary returned by [`StreamLogBus::pending`]
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub id: u64,
    pub consumer: String,
    pub delivery_count: u32,
    pub last_delivery: DateTime<Utc>,
}

struct PendingEntry {
    envelope: EventEnvelope,
    consumer: String,
    delivery_count: u32,
    last_delivery: DateTime<Utc>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<(u64, EventEnvelope)>,
    next_id: u64,
    groups: HashMap<String, GroupState>,
}

/// Stream-log [`EventBus`] backend
#[derive(Clone)]
pub struct StreamLogBus {
    registry: Arc<SchemaRegistry>,
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    notify: Arc<Notify>,
    config: StreamLogConfig,
    dlq: DeadLetterQueue,
}

impl StreamLogBus {
    pub fn new(config: StreamLogConfig) -> Self {
        Self::with_registry(Arc::new(SchemaRegistry::new()), config)
    }

    pub fn with_registry(registry: Arc<SchemaRegistry>, config: StreamLogConfig) -> Self {
        Self {
            registry,
            streams: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            config,
            dlq: DeadLetterQueue::new(),
        }
    }

    /// Shared handle to the registry
    pub fn registry_arc(&self) -> Arc<SchemaRegistry> {
        self.registry.clone()
    }

    /// Append an envelope to a stream, trimming to `max_len`
    ///
    /// Returns the entry id. Trimming only drops from the log; entries
    /// already pending for a group stay claimable until acked or
    /// dead-lettered.
    pub fn add(&self, stream: &str, envelope: EventEnvelope) -> u64 {
        let id = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            state.next_id += 1;
            let id = state.next_id;
            state.entries.push_back((id, envelope));
            if let Some(max_len) = self.config.max_len {
                while state.entries.len() > max_len {
                    state.entries.pop_front();
                }
            }
            id
        };
        self.notify.notify_waiters();
        id
    }

    /// Current log length of a stream
    pub fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// Register a consumer group on a stream
    ///
    /// `from_beginning` controls whether the group sees existing entries or
    /// only ones appended after registration. Registering an existing group
    /// is a no-op.
    pub fn create_group(&self, stream: &str, group: &str, from_beginning: bool) {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let start = if from_beginning { 0 } else { state.next_id };
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: start,
                pending: BTreeMap::new(),
            });
    }

    /// Read new entries for a consumer, blocking up to `block_timeout`
    ///
    /// Delivered entries are added to the group's pending list and stay
    /// there until [`ack`](Self::ack)ed.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<(u64, EventEnvelope)>> {
        let deadline = tokio::time::Instant::now() + self.config.block_timeout;
        loop {
            let notified = self.notify.notified();
            let batch = self.read_group_now(stream, group, consumer)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    fn read_group_now(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<(u64, EventEnvelope)>> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| EventBusError::UnknownStream(stream.to_string()))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| EventBusError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut batch = Vec::new();
        for (id, envelope) in state.entries.iter() {
            if *id <= group_state.last_delivered {
                continue;
            }
            if batch.len() >= self.config.batch_size {
                break;
            }
            group_state.last_delivered = *id;
            group_state.pending.insert(
                *id,
                PendingEntry {
                    envelope: envelope.clone(),
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    last_delivery: Utc::now(),
                },
            );
            batch.push((*id, envelope.clone()));
        }
        Ok(batch)
    }

    /// Acknowledge an entry, removing it from the group's pending list
    pub fn ack(&self, stream: &str, group: &str, id: u64) -> Result<()> {
        let mut streams = self.streams.lock();
        let group_state = streams
            .get_mut(stream)
            .ok_or_else(|| EventBusError::UnknownStream(stream.to_string()))?
            .groups
            .get_mut(group)
            .ok_or_else(|| EventBusError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        group_state.pending.remove(&id);
        Ok(())
    }

    /// Pending (delivered, unacked) entries for a group
    pub fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingInfo>> {
        let streams = self.streams.lock();
        let group_state = streams
            .get(stream)
            .ok_or_else(|| EventBusError::UnknownStream(stream.to_string()))?
            .groups
            .get(group)
            .ok_or_else(|| EventBusError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(group_state
            .pending
            .iter()
            .map(|(id, entry)| PendingInfo {
                id: *id,
                consumer: entry.consumer.clone(),
                delivery_count: entry.delivery_count,
                last_delivery: entry.last_delivery,
            })
            .collect())
    }

    /// Claim pending entries idle for at least `min_idle` for a consumer
    ///
    /// Each claim counts as a delivery. Entries whose delivery count has
    /// already reached `max_retries` are routed to the dead-letter queue
    /// and acked instead of being returned.
    pub fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<(u64, EventEnvelope)>> {
        let min_idle = ChronoDuration::from_std(min_idle).unwrap_or(ChronoDuration::zero());
        let mut claimed = Vec::new();
        let mut dead = Vec::new();
        {
            let mut streams = self.streams.lock();
            let group_state = streams
                .get_mut(stream)
                .ok_or_else(|| EventBusError::UnknownStream(stream.to_string()))?
                .groups
                .get_mut(group)
                .ok_or_else(|| EventBusError::UnknownGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })?;

            let now = Utc::now();
            let eligible: Vec<u64> = group_state
                .pending
                .iter()
                .filter(|(_, e)| now - e.last_delivery >= min_idle)
                .map(|(id, _)| *id)
                .collect();

            for id in eligible {
                let entry = group_state.pending.get_mut(&id).expect("entry just listed");
                if entry.delivery_count >= self.config.max_retries {
                    let removed = group_state.pending.remove(&id).expect("entry just listed");
                    dead.push((removed.envelope, removed.delivery_count));
                    continue;
                }
                entry.delivery_count += 1;
                entry.consumer = consumer.to_string();
                entry.last_delivery = now;
                claimed.push((id, entry.envelope.clone()));
            }
        }
        // DLQ writes happen outside the stream lock; the callback is
        // arbitrary user code.
        for (envelope, attempts) in dead {
            self.dlq.push(envelope, "max delivery retries exceeded", attempts);
        }
        Ok(claimed)
    }
}

#[async_trait]
impl EventBus for StreamLogBus {
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
        self.add(&channel.name, envelope.clone());
        Ok(envelope)
    }

    async fn subscribe(
        &self,
        channel: &Channel,
        filter: SubscriptionFilter,
    ) -> Result<EventStream> {
        let group = format!("sub-{}", Uuid::new_v4());
        let consumer = "consumer-0".to_string();
        self.create_group(&channel.name, &group, true);

        let bus = self.clone();
        let stream_name = channel.name.clone();
        let stream = async_stream::stream! {
            loop {
                // Retry previously-failed deliveries first; claim() routes
                // exhausted entries to the DLQ.
                let mut batch = match bus.claim(&stream_name, &group, &consumer, Duration::ZERO) {
                    Ok(claimed) => claimed,
                    Err(_) => break,
                };
                match bus.read_group(&stream_name, &group, &consumer).await {
                    Ok(fresh) => batch.extend(fresh),
                    Err(_) => break,
                }

                for (id, envelope) in batch {
                    if !filter.matches(&envelope) {
                        let _ = bus.ack(&stream_name, &group, id);
                        continue;
                    }
                    let codec = match bus
                        .registry
                        .codec_for(&envelope.event_type, envelope.schema_version)
                    {
                        Ok(codec) => codec,
                        // Unregistered schema never becomes decodable;
                        // leave pending so claim() retries then dead-letters.
                        Err(_) => continue,
                    };
                    match codec.decode(&envelope.payload) {
                        Ok(payload) => {
                            let _ = bus.ack(&stream_name, &group, id);
                            yield (envelope, payload);
                        }
                        Err(_) => continue,
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
        Channel::new("jobs", "spice.job.created", 1)
    }

    fn bus() -> StreamLogBus {
        let bus = StreamLogBus::new(StreamLogConfig {
            block_timeout: Duration::from_millis(10),
            ..StreamLogConfig::default()
        });
        bus.registry().register_json("spice.job.created", 1);
        bus
    }

    async fn publish_seq(bus: &StreamLogBus, n: usize) {
        for i in 0..n {
            bus.publish(&channel(), json!({"seq": i}), EventMetadata::new())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_read_resumes_after_ack() {
        let bus = bus();
        bus.create_group("jobs", "g", true);
        publish_seq(&bus, 3).await;

        let batch = bus.read_group("jobs", "g", "c1").await.unwrap();
        assert_eq!(batch.len(), 3);
        for (id, _) in &batch {
            bus.ack("jobs", "g", *id).unwrap();
        }
        assert!(bus.pending("jobs", "g").unwrap().is_empty());

        // A fresh read only sees entries appended after the last delivery.
        publish_seq(&bus, 1).await;
        let next = bus.read_group("jobs", "g", "c1").await.unwrap();
        assert_eq!(next.len(), 1);
    }

    #[tokio::test]
    async fn test_unacked_entries_are_claimable() {
        let bus = bus();
        bus.create_group("jobs", "g", true);
        publish_seq(&bus, 2).await;

        let batch = bus.read_group("jobs", "g", "c1").await.unwrap();
        assert_eq!(batch.len(), 2);
        // c1 dies without acking; c2 takes over.
        let claimed = bus.claim("jobs", "g", "c2", Duration::ZERO).unwrap();
        assert_eq!(claimed.len(), 2);

        let pending = bus.pending("jobs", "g").unwrap();
        assert!(pending.iter().all(|p| p.consumer == "c2"));
        assert!(pending.iter().all(|p| p.delivery_count == 2));
    }

    #[tokio::test]
    async fn test_exhausted_retries_route_to_dlq() {
        let bus = StreamLogBus::new(StreamLogConfig {
            max_retries: 2,
            block_timeout: Duration::from_millis(10),
            ..StreamLogConfig::default()
        });
        bus.registry().register_json("spice.job.created", 1);
        bus.create_group("jobs", "g", true);
        bus.publish(&channel(), json!({"seq": 0}), EventMetadata::new())
            .await
            .unwrap();

        bus.read_group("jobs", "g", "c1").await.unwrap(); // delivery 1
        bus.claim("jobs", "g", "c1", Duration::ZERO).unwrap(); // delivery 2
        let third = bus.claim("jobs", "g", "c1", Duration::ZERO).unwrap(); // exhausted
        assert!(third.is_empty());

        assert_eq!(bus.dead_letters().len(), 1);
        assert_eq!(bus.dead_letters()[0].attempt_count, 2);
        assert!(bus.pending("jobs", "g").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_trims_to_max_len() {
        let bus = StreamLogBus::new(StreamLogConfig {
            max_len: Some(3),
            block_timeout: Duration::from_millis(10),
            ..StreamLogConfig::default()
        });
        bus.registry().register_json("spice.job.created", 1);
        publish_seq(&bus, 10).await;
        assert_eq!(bus.len("jobs"), 3);
    }

    #[tokio::test]
    async fn test_group_from_end_sees_only_new_entries() {
        let bus = bus();
        publish_seq(&bus, 5).await;
        bus.create_group("jobs", "late", false);

        publish_seq(&bus, 1).await;
        let batch = bus.read_group("jobs", "late", "c1").await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_and_acks() {
        use futures::StreamExt;

        let bus = bus();
        publish_seq(&bus, 2).await;

        let mut stream = bus
            .subscribe(&channel(), SubscriptionFilter::all())
            .await
            .unwrap();
        let (_, first) = stream.next().await.unwrap();
        let (_, second) = stream.next().await.unwrap();
        assert_eq!(first["seq"], json!(0));
        assert_eq!(second["seq"], json!(1));
    }
}
