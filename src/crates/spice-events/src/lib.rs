//! Event plane for the spice runtime
//!
//! Typed pub/sub used both internally (run/node lifecycle, tool-call events)
//! and to surface human-in-the-loop prompts. A channel is the triple
//! `(name, event_type, schema_version)`; publishing requires the
//! `(event_type, schema_version)` pair to be registered in a
//! [`SchemaRegistry`] - unregistered pairs fail closed.
//!
//! Three behavior-equivalent backends implement [`EventBus`]:
//!
//! - [`InMemoryEventBus`] - bounded replay history + live broadcast
//! - [`StreamLogBus`] - stream-log semantics (consumer groups, acks,
//!   pending-entry recovery, approximate trimming)
//! - [`PartitionedLogBus`] - partitioned-log semantics (partition-key
//!   hashing, consumer-group offsets, poll-based delivery)
//!
//! All backends guarantee per-channel (or per-partition) ordering only, are
//! safe for concurrent producers, and divert undeliverable events to a
//! [`DeadLetterQueue`].

pub mod bus;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod memory;
pub mod partitioned_log;
pub mod schema;
pub mod stream_log;

pub use bus::{EventBus, EventStream};
pub use dlq::{DeadLetter, DeadLetterQueue, DlqCallback};
pub use envelope::{Channel, EventEnvelope, EventMetadata};
pub use error::{EventBusError, Result};
pub use filter::SubscriptionFilter;
pub use memory::InMemoryEventBus;
pub use partitioned_log::{OffsetReset, PartitionedLogBus, PartitionedLogConfig};
pub use schema::{EventCodec, JsonCodec, SchemaRegistry};
pub use stream_log::{PendingInfo, StreamLogBus, StreamLogConfig};
