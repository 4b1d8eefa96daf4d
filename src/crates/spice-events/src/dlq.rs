//! Dead-letter queue
//!
//! Malformed or repeatedly-failing events are written here instead of being
//! redelivered forever. The DLQ takes ownership of the envelope; an optional
//! callback is invoked synchronously on the writing dispatcher so operators
//! can alert or mirror entries elsewhere.

use crate::envelope::EventEnvelope;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Callback invoked synchronously for every DLQ write
pub type DlqCallback = Arc<dyn Fn(&EventEnvelope, &str) + Send + Sync>;

/// One dead-lettered event
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Why delivery was abandoned
    pub reason: String,
    /// The envelope as last seen by the bus
    pub original_envelope: EventEnvelope,
    /// Delivery attempts made before dead-lettering
    pub attempt_count: u32,
    /// First time this envelope failed
    pub first_seen_at: DateTime<Utc>,
}

/// Shared dead-letter queue used by all bus backends
#[derive(Clone, Default)]
pub struct DeadLetterQueue {
    entries: Arc<RwLock<Vec<DeadLetter>>>,
    callback: Arc<RwLock<Option<DlqCallback>>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the synchronous write callback (replaces any previous one)
    pub fn set_callback(&self, callback: DlqCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Record a dead letter and invoke the callback on this thread
    pub fn push(&self, envelope: EventEnvelope, reason: impl Into<String>, attempt_count: u32) {
        let reason = reason.into();
        tracing::warn!(
            envelope_id = %envelope.id,
            channel = %envelope.channel_name,
            attempts = attempt_count,
            reason = %reason,
            "Event routed to dead-letter queue"
        );
        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            cb(&envelope, &reason);
        }
        self.entries.write().push(DeadLetter {
            reason,
            original_envelope: envelope,
            attempt_count,
            first_seen_at: Utc::now(),
        });
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop all entries (useful for testing)
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Channel, EventMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope() -> EventEnvelope {
        EventEnvelope::new(
            &Channel::new("runs", "spice.run.completed", 1),
            "{bad".to_string(),
            EventMetadata::new(),
        )
    }

    #[test]
    fn test_push_records_entry() {
        let dlq = DeadLetterQueue::new();
        dlq.push(envelope(), "decode failure", 3);

        let entries = dlq.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "decode failure");
        assert_eq!(entries[0].attempt_count, 3);
    }

    #[test]
    fn test_callback_invoked_synchronously_per_write() {
        let dlq = DeadLetterQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        dlq.set_callback(Arc::new(move |_, reason| {
            assert_eq!(reason, "decode failure");
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        dlq.push(envelope(), "decode failure", 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        dlq.push(envelope(), "decode failure", 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
