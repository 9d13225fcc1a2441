use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Level of delivery guarantee for a subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryGuarantee {
    /// Every message is delivered at least once. Redelivered copies may overlap
    /// with an earlier copy that is still being processed.
    #[default]
    AtLeastOnce,

    /// Every message is processed successfully at most once, backed by the
    /// dedup ledger.
    ExactlyOnce,

    /// Messages are retried on failure, but never with two copies of the same
    /// message outstanding at once. Ordering keys do not hold back later batches.
    AtMostOnceWithRetry,
}

impl DeliveryGuarantee {
    /// Whether a later batch for an ordering key must wait until the previous
    /// batch for that key has been resolved.
    #[must_use]
    pub const fn requires_ordered_completion(self) -> bool {
        matches!(self, Self::AtLeastOnce | Self::ExactlyOnce)
    }

    /// Whether copies superseded by a newer attempt may still reach the handler.
    #[must_use]
    pub const fn allows_overlapping_copies(self) -> bool {
        matches!(self, Self::AtLeastOnce)
    }
}

/// Options for a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Maximum payload size accepted by publishes while subscribed.
    pub max_message_size: usize,

    /// How long a delivered message may stay unacknowledged before it is
    /// considered lost.
    pub ack_timeout: Duration,

    /// Delivery guarantee for the lifetime of the subscription.
    pub delivery_guarantee: DeliveryGuarantee,

    /// Upper bound on redelivery attempts for a single message.
    pub max_retries: u32,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024, // 1MB
            ack_timeout: Duration::from_secs(30),
            delivery_guarantee: DeliveryGuarantee::AtLeastOnce,
            max_retries: 3,
        }
    }
}

impl SubscriptionOptions {
    /// Sets the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Sets the ack timeout.
    #[must_use]
    pub const fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Sets the delivery guarantee.
    #[must_use]
    pub const fn with_delivery_guarantee(mut self, delivery_guarantee: DeliveryGuarantee) -> Self {
        self.delivery_guarantee = delivery_guarantee;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Longest time a single message can remain in redelivery:
    /// `ack_timeout * (max_retries + 1)`.
    #[must_use]
    pub fn redelivery_span(&self) -> Duration {
        self.ack_timeout
            .saturating_mul(self.max_retries.saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_span() {
        let options = SubscriptionOptions::default()
            .with_ack_timeout(Duration::from_millis(100))
            .with_max_retries(2);

        assert_eq!(options.redelivery_span(), Duration::from_millis(300));
    }

    #[test]
    fn test_guarantee_coupling() {
        assert!(DeliveryGuarantee::AtLeastOnce.requires_ordered_completion());
        assert!(DeliveryGuarantee::ExactlyOnce.requires_ordered_completion());
        assert!(!DeliveryGuarantee::AtMostOnceWithRetry.requires_ordered_completion());
        assert!(!DeliveryGuarantee::ExactlyOnce.allows_overlapping_copies());
    }
}
