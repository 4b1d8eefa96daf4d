//! Subscription filtering
//!
//! Subscribers may narrow delivery with a predicate over the envelope plus
//! metadata include/exclude lists. Filters run on the subscriber's side of
//! the bus; filtered-out events are still acked (they are delivered and
//! discarded, not left pending).

use crate::envelope::EventEnvelope;
use std::collections::HashMap;
use std::sync::Arc;

type EnvelopePredicate = dyn Fn(&EventEnvelope) -> bool + Send + Sync;

/// Filter applied to each envelope before it reaches a subscriber
#[derive(Clone, Default)]
pub struct SubscriptionFilter {
    predicate: Option<Arc<EnvelopePredicate>>,
    /// Metadata field -> allowed values; a listed field must match one
    include: HashMap<String, Vec<String>>,
    /// Metadata field -> denied values; a match rejects the envelope
    exclude: HashMap<String, Vec<String>>,
}

impl SubscriptionFilter {
    /// Filter that accepts everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict delivery to envelopes with the given `userId`
    pub fn by_user_id(user_id: impl Into<String>) -> Self {
        Self::all().include("userId", [user_id.into()])
    }

    /// Restrict delivery to envelopes with the given `tenantId`
    pub fn by_tenant_id(tenant_id: impl Into<String>) -> Self {
        Self::all().include("tenantId", [tenant_id.into()])
    }

    /// Attach a custom predicate over the full envelope
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EventEnvelope) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Require the metadata field to equal one of the given values
    pub fn include<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include
            .entry(field.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Reject envelopes whose metadata field equals one of the given values
    pub fn exclude<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude
            .entry(field.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Whether the envelope passes this filter
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        for (field, allowed) in &self.include {
            match envelope.metadata.field(field) {
                Some(value) if allowed.iter().any(|v| v == value) => {}
                _ => return false,
            }
        }
        for (field, denied) in &self.exclude {
            if let Some(value) = envelope.metadata.field(field) {
                if denied.iter().any(|v| v == value) {
                    return false;
                }
            }
        }
        self.predicate.as_ref().map(|p| p(envelope)).unwrap_or(true)
    }
}

impl std::fmt::Debug for SubscriptionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionFilter")
            .field("has_predicate", &self.predicate.is_some())
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Channel, EventMetadata};

    fn envelope_for_user(user: &str) -> EventEnvelope {
        EventEnvelope::new(
            &Channel::new("runs", "spice.run.completed", 1),
            "{}".to_string(),
            EventMetadata::new().with_user_id(user),
        )
    }

    #[test]
    fn test_all_accepts_everything() {
        assert!(SubscriptionFilter::all().matches(&envelope_for_user("u-1")));
    }

    #[test]
    fn test_by_user_id() {
        let filter = SubscriptionFilter::by_user_id("u-1");
        assert!(filter.matches(&envelope_for_user("u-1")));
        assert!(!filter.matches(&envelope_for_user("u-2")));
    }

    #[test]
    fn test_include_requires_field_present() {
        let filter = SubscriptionFilter::all().include("tenantId", ["t-1"]);
        // userId-only metadata has no tenantId, so the include fails.
        assert!(!filter.matches(&envelope_for_user("u-1")));
    }

    #[test]
    fn test_exclude_rejects_listed_values() {
        let filter = SubscriptionFilter::all().exclude("userId", ["u-2"]);
        assert!(filter.matches(&envelope_for_user("u-1")));
        assert!(!filter.matches(&envelope_for_user("u-2")));
    }

    #[test]
    fn test_predicate_composes_with_lists() {
        let filter = SubscriptionFilter::by_user_id("u-1")
            .with_predicate(|env| env.event_type.ends_with(".completed"));
        assert!(filter.matches(&envelope_for_user("u-1")));

        let other = EventEnvelope::new(
            &Channel::new("runs", "spice.run.started", 1),
            "{}".to_string(),
            EventMetadata::new().with_user_id("u-1"),
        );
        assert!(!filter.matches(&other));
    }
}
