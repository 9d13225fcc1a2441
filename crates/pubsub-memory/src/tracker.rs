//! In-flight delivery tracking for one subscription.
//!
//! The tracker is pure bookkeeping: it decides what should happen to a
//! message on ack, timeout or failure and leaves the side effects (emitting
//! outcomes, releasing lanes, sending copies to the handler) to the partition.

use std::collections::HashMap;

use proven_pubsub::{
    message::now_millis, AckMessage, DeliveryGuarantee, DeliveryStatus, FailureReason, Message,
    MessageId, SubscriptionOptions,
};
use tokio::time::Instant;

use crate::ledger::DedupLedger;
use crate::sequencer::{SequenceKey, Sequenced};

/// A message handed to the subscription and not yet resolved.
#[derive(Debug)]
pub struct PendingDelivery {
    /// The message.
    pub message: Message,

    /// Lane the message came from.
    pub key: SequenceKey,

    /// Publish sequence number, kept so the message can be requeued in order.
    pub seq: u64,

    /// Failed attempts so far.
    pub retries: u32,

    /// Generation of the current copy.
    pub attempt: u32,

    /// Times a copy was handed to the handler.
    pub deliveries: u32,

    /// When the current copy times out. Armed at handoff.
    pub deadline: Option<Instant>,

    /// Whether the current copy has reached the handler.
    pub handed_off: bool,

    /// Last error reported by the handler.
    pub last_error: Option<String>,
}

impl PendingDelivery {
    /// Converts back into a sequencer item, keeping retry counts.
    #[must_use]
    pub fn into_sequenced(self) -> (SequenceKey, Sequenced) {
        (
            self.key,
            Sequenced {
                message: self.message,
                seq: self.seq,
                retries: self.retries,
                deliveries: self.deliveries,
            },
        )
    }
}

/// One copy of a message on its way to the handler.
#[derive(Clone, Debug)]
pub struct DeliveryCopy {
    /// The message.
    pub message: Message,

    /// Generation the copy belongs to.
    pub attempt: u32,
}

/// What the partition should do after an ack, timeout or failure.
#[derive(Debug)]
pub enum Resolution {
    /// The message is done. Release its lane and report `status`.
    Resolved {
        /// The finished delivery.
        delivery: PendingDelivery,
        /// Terminal status.
        status: DeliveryStatus,
    },

    /// Send another copy to the handler.
    Redeliver {
        /// Lane of the message.
        key: SequenceKey,
        /// The copy.
        copy: DeliveryCopy,
    },

    /// The subscription is draining. Return the message to its lane.
    Requeue(PendingDelivery),

    /// Nothing to do.
    Ignored,
}

/// Tracks in-flight deliveries of one subscription.
#[derive(Debug)]
pub struct AckTracker {
    options: SubscriptionOptions,
    inflight: HashMap<MessageId, PendingDelivery>,
}

impl AckTracker {
    /// Creates an empty tracker for a subscription.
    #[must_use]
    pub fn new(options: SubscriptionOptions) -> Self {
        Self {
            options,
            inflight: HashMap::new(),
        }
    }

    /// Options of the subscription.
    #[must_use]
    pub const fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    const fn guarantee(&self) -> DeliveryGuarantee {
        self.options.delivery_guarantee
    }

    /// Starts tracking a dispatched message.
    ///
    /// # Errors
    /// Returns the item back if a message with the same id is already in
    /// flight.
    pub fn track(&mut self, key: SequenceKey, item: Sequenced) -> Result<DeliveryCopy, Sequenced> {
        if self.inflight.contains_key(&item.message.message_id) {
            return Err(item);
        }

        let copy = DeliveryCopy {
            message: item.message.clone(),
            attempt: 0,
        };
        self.inflight.insert(
            item.message.message_id.clone(),
            PendingDelivery {
                message: item.message,
                key,
                seq: item.seq,
                retries: item.retries,
                attempt: 0,
                deliveries: item.deliveries,
                deadline: None,
                handed_off: false,
                last_error: None,
            },
        );

        Ok(copy)
    }

    /// Records that a copy is about to reach the handler and arms its
    /// deadline.
    ///
    /// Returns `false` if the copy must be skipped: the message is no longer
    /// tracked, or a newer copy exists and the guarantee forbids overlap.
    pub fn hand_off(&mut self, message_id: &MessageId, attempt: u32, now: Instant) -> bool {
        let ack_timeout = self.options.ack_timeout;
        let overlap = self.guarantee().allows_overlapping_copies();

        let Some(delivery) = self.inflight.get_mut(message_id) else {
            return false;
        };

        if attempt == delivery.attempt {
            delivery.handed_off = true;
            delivery.deadline = Some(now + ack_timeout);
        } else if !overlap {
            return false;
        }

        delivery.deliveries += 1;
        true
    }

    /// Resolves an acknowledgement from the subscriber.
    pub fn on_ack(&mut self, ack: AckMessage, draining: bool, ledger: &DedupLedger) -> Resolution {
        let Some(handed_off) = self
            .inflight
            .get(&ack.message_id)
            .map(|delivery| delivery.handed_off)
        else {
            return Resolution::Ignored;
        };

        match ack.error {
            None => {
                let status = if self.guarantee() == DeliveryGuarantee::ExactlyOnce
                    && !ledger.mark_success(&ack.message_id, now_millis())
                {
                    DeliveryStatus::Deduplicated
                } else {
                    DeliveryStatus::Acknowledged
                };

                self.inflight
                    .remove(&ack.message_id)
                    .map_or(Resolution::Ignored, |delivery| Resolution::Resolved {
                        delivery,
                        status,
                    })
            }
            // An error for a copy that has not reached the handler yet
            // belongs to an earlier attempt that was already counted.
            Some(_) if !handed_off => Resolution::Ignored,
            Some(error) => self.fail(&ack.message_id, Some(error), draining, ledger),
        }
    }

    /// Fails every handed-off delivery whose deadline has passed.
    pub fn expire(&mut self, now: Instant, draining: bool, ledger: &DedupLedger) -> Vec<Resolution> {
        let mut expired: Vec<(u64, MessageId)> = self
            .inflight
            .values()
            .filter(|delivery| delivery.deadline.is_some_and(|deadline| deadline <= now))
            .map(|delivery| (delivery.seq, delivery.message.message_id.clone()))
            .collect();
        expired.sort_unstable_by_key(|(seq, _)| *seq);

        expired
            .into_iter()
            .map(|(_, message_id)| self.fail(&message_id, None, draining, ledger))
            .collect()
    }

    fn fail(
        &mut self,
        message_id: &MessageId,
        error: Option<String>,
        draining: bool,
        ledger: &DedupLedger,
    ) -> Resolution {
        let max_retries = self.options.max_retries;
        let exactly_once = self.guarantee() == DeliveryGuarantee::ExactlyOnce;

        let Some(delivery) = self.inflight.get_mut(message_id) else {
            return Resolution::Ignored;
        };

        delivery.retries += 1;
        if error.is_some() {
            delivery.last_error = error;
        }

        if delivery.retries > max_retries {
            return self.resolve(
                message_id,
                DeliveryStatus::Failed {
                    reason: FailureReason::RetriesExhausted,
                    last_error: None,
                },
            );
        }

        if exactly_once && ledger.contains(message_id) {
            return self.resolve(message_id, DeliveryStatus::Deduplicated);
        }

        if draining {
            return self
                .inflight
                .remove(message_id)
                .map_or(Resolution::Ignored, Resolution::Requeue);
        }

        delivery.attempt += 1;
        delivery.handed_off = false;
        delivery.deadline = None;

        Resolution::Redeliver {
            key: delivery.key.clone(),
            copy: DeliveryCopy {
                message: delivery.message.clone(),
                attempt: delivery.attempt,
            },
        }
    }

    fn resolve(&mut self, message_id: &MessageId, status: DeliveryStatus) -> Resolution {
        let Some(delivery) = self.inflight.remove(message_id) else {
            return Resolution::Ignored;
        };

        let status = match status {
            DeliveryStatus::Failed { reason, .. } => DeliveryStatus::Failed {
                reason,
                last_error: delivery.last_error.clone(),
            },
            status => status,
        };

        Resolution::Resolved { delivery, status }
    }

    /// Removes deliveries whose current copy never reached the handler.
    pub fn take_unhanded(&mut self) -> Vec<PendingDelivery> {
        let ids: Vec<MessageId> = self
            .inflight
            .values()
            .filter(|delivery| !delivery.handed_off)
            .map(|delivery| delivery.message.message_id.clone())
            .collect();

        let mut taken: Vec<PendingDelivery> = ids
            .iter()
            .filter_map(|id| self.inflight.remove(id))
            .collect();
        taken.sort_unstable_by_key(|delivery| delivery.seq);
        taken
    }

    /// Removes every delivery, oldest first.
    pub fn drain(&mut self) -> Vec<PendingDelivery> {
        let mut drained: Vec<PendingDelivery> = self.inflight.drain().map(|(_, d)| d).collect();
        drained.sort_unstable_by_key(|delivery| delivery.seq);
        drained
    }

    /// Number of deliveries in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::config::DedupLedgerConfig;

    fn options(guarantee: DeliveryGuarantee, max_retries: u32) -> SubscriptionOptions {
        SubscriptionOptions::default()
            .with_ack_timeout(Duration::from_millis(100))
            .with_delivery_guarantee(guarantee)
            .with_max_retries(max_retries)
    }

    fn item(id: &'static str, seq: u64) -> Sequenced {
        Sequenced {
            message: Message::from(id).with_message_id(id),
            seq,
            retries: 0,
            deliveries: 0,
        }
    }

    fn ledger() -> DedupLedger {
        DedupLedger::new(DedupLedgerConfig::default())
    }

    #[tokio::test]
    async fn test_success_resolves() {
        let ledger = ledger();
        let mut tracker = AckTracker::new(options(DeliveryGuarantee::AtLeastOnce, 3));
        let copy = tracker.track(SequenceKey::Unordered, item("a", 0)).unwrap();
        assert!(tracker.hand_off(&copy.message.message_id, copy.attempt, Instant::now()));

        let resolution = tracker.on_ack(AckMessage::success("a".into()), false, &ledger);
        assert!(matches!(
            resolution,
            Resolution::Resolved {
                status: DeliveryStatus::Acknowledged,
                ..
            }
        ));
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_track_rejected() {
        let mut tracker = AckTracker::new(options(DeliveryGuarantee::AtLeastOnce, 3));
        tracker.track(SequenceKey::Unordered, item("a", 0)).unwrap();
        assert!(tracker.track(SequenceKey::Unordered, item("a", 1)).is_err());
    }

    #[tokio::test]
    async fn test_failures_exhaust_retries() {
        let ledger = ledger();
        let mut tracker = AckTracker::new(options(DeliveryGuarantee::AtLeastOnce, 1));
        let id = MessageId::from("a");
        let copy = tracker.track(SequenceKey::Unordered, item("a", 0)).unwrap();
        tracker.hand_off(&id, copy.attempt, Instant::now());

        let Resolution::Redeliver { copy, .. } =
            tracker.on_ack(AckMessage::failure(id.clone(), "boom"), false, &ledger)
        else {
            panic!("expected redelivery");
        };
        assert_eq!(copy.attempt, 1);
        tracker.hand_off(&id, copy.attempt, Instant::now());

        let resolution = tracker.on_ack(AckMessage::failure(id, "boom again"), false, &ledger);
        let Resolution::Resolved { delivery, status } = resolution else {
            panic!("expected terminal failure");
        };
        assert_eq!(delivery.deliveries, 2);
        assert_eq!(
            status,
            DeliveryStatus::Failed {
                reason: FailureReason::RetriesExhausted,
                last_error: Some("boom again".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_error_before_handoff_ignored() {
        let ledger = ledger();
        let mut tracker = AckTracker::new(options(DeliveryGuarantee::AtLeastOnce, 3));
        tracker.track(SequenceKey::Unordered, item("a", 0)).unwrap();

        let resolution = tracker.on_ack(AckMessage::failure("a".into(), "late"), false, &ledger);
        assert!(matches!(resolution, Resolution::Ignored));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_armed_at_handoff() {
        let ledger = ledger();
        let mut tracker = AckTracker::new(options(DeliveryGuarantee::AtLeastOnce, 3));
        let id = MessageId::from("a");
        tracker.track(SequenceKey::Unordered, item("a", 0)).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tracker.expire(Instant::now(), false, &ledger).is_empty());

        tracker.hand_off(&id, 0, Instant::now());
        tokio::time::advance(Duration::from_millis(100)).await;

        let expired = tracker.expire(Instant::now(), false, &ledger);
        assert_eq!(expired.len(), 1);
        assert!(matches!(expired[0], Resolution::Redeliver { .. }));
    }

    #[tokio::test]
    async fn test_stale_copy_skipped_without_overlap() {
        let ledger = ledger();
        let id = MessageId::from("a");

        for (guarantee, delivered) in [
            (DeliveryGuarantee::AtLeastOnce, true),
            (DeliveryGuarantee::AtMostOnceWithRetry, false),
            (DeliveryGuarantee::ExactlyOnce, false),
        ] {
            let mut tracker = AckTracker::new(options(guarantee, 3));
            tracker.track(SequenceKey::Unordered, item("a", 0)).unwrap();
            tracker.hand_off(&id, 0, Instant::now());
            tracker.on_ack(AckMessage::failure(id.clone(), "boom"), false, &ledger);

            assert_eq!(tracker.hand_off(&id, 0, Instant::now()), delivered);
            assert!(tracker.hand_off(&id, 1, Instant::now()));
        }
    }

    #[tokio::test]
    async fn test_exactly_once_duplicate_success() {
        let ledger = ledger();
        let id = MessageId::from("a");
        ledger.mark_success(&id, 1);

        let mut tracker = AckTracker::new(options(DeliveryGuarantee::ExactlyOnce, 3));
        tracker.track(SequenceKey::Unordered, item("a", 0)).unwrap();
        tracker.hand_off(&id, 0, Instant::now());

        let resolution = tracker.on_ack(AckMessage::success(id.clone()), false, &ledger);
        assert!(matches!(
            resolution,
            Resolution::Resolved {
                status: DeliveryStatus::Deduplicated,
                ..
            }
        ));

        let again = tracker.on_ack(AckMessage::success(id), false, &ledger);
        assert!(matches!(again, Resolution::Ignored));
    }

    #[tokio::test]
    async fn test_draining_requeues_failures() {
        let ledger = ledger();
        let id = MessageId::from("a");
        let mut tracker = AckTracker::new(options(DeliveryGuarantee::AtLeastOnce, 3));
        tracker.track(SequenceKey::Unordered, item("a", 7)).unwrap();
        tracker.hand_off(&id, 0, Instant::now());

        let Resolution::Requeue(delivery) =
            tracker.on_ack(AckMessage::failure(id, "boom"), true, &ledger)
        else {
            panic!("expected requeue");
        };
        let (_, item) = delivery.into_sequenced();
        assert_eq!(item.seq, 7);
        assert_eq!(item.retries, 1);
        assert_eq!(item.deliveries, 1);
    }

    #[tokio::test]
    async fn test_take_unhanded() {
        let mut tracker = AckTracker::new(options(DeliveryGuarantee::AtLeastOnce, 3));
        tracker.track(SequenceKey::Unordered, item("a", 0)).unwrap();
        tracker.track(SequenceKey::Unordered, item("b", 1)).unwrap();
        tracker.hand_off(&MessageId::from("a"), 0, Instant::now());

        let taken = tracker.take_unhanded();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].message.message_id.as_str(), "b");
        assert_eq!(tracker.len(), 1);
    }
}
