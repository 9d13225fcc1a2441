mod driver;
mod state;

use state::{ActiveSubscription, Lifecycle, PartitionState, WorkItem};

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_pubsub::{
    AckMessage, AckReceiver, BatchHandler, DeliveryGuarantee, DeliveryOutcome, DeliveryStatus,
    FailureReason, Message, MessageId, Partition, PublishMetadata, SubscriberMetadata,
    SubscriptionOptions,
};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BacklogPolicy, DedupLedgerConfig, PartitionConfig};
use crate::ledger::DedupLedger;
use crate::sequencer::{SequenceKey, Sequencer};
use crate::tracker::{AckTracker, DeliveryCopy, Resolution};
use crate::Error;

type Redeliveries = Vec<(SequenceKey, Vec<DeliveryCopy>)>;

/// Batches the delivery worker may have queued ahead of the handler. Further
/// messages wait in the sequencer, where they still count against the
/// backlog.
const WORK_QUEUE_DEPTH: usize = 8;

/// An in-memory partition.
///
/// Cloning is cheap; clones share the same partition.
#[derive(Clone)]
pub struct MemoryPartition {
    inner: Arc<PartitionInner>,
}

struct PartitionInner {
    topic: String,
    id: u64,
    config: PartitionConfig,
    ledger: DedupLedger,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    state: Mutex<PartitionState>,

    /// Wakes the driver after a publish.
    wake: Notify,

    /// Wakes publishers waiting for backlog space or a lifecycle change.
    space: Notify,

    /// Wakes drains waiting for in-flight deliveries.
    resolved: Notify,
}

impl Debug for MemoryPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPartition")
            .field("topic", &self.inner.topic)
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl MemoryPartition {
    /// Creates a standalone partition with its own dedup ledger and outcome
    /// channel.
    #[must_use]
    pub fn new<S>(topic: S, id: u64, config: PartitionConfig) -> Self
    where
        S: Into<String>,
    {
        let (outcomes, _) = broadcast::channel(config.outcome_buffer.max(1));
        Self::with_shared(
            topic.into(),
            id,
            config,
            DedupLedger::new(DedupLedgerConfig::default()),
            outcomes,
        )
    }

    pub(crate) fn with_shared(
        topic: String,
        id: u64,
        config: PartitionConfig,
        ledger: DedupLedger,
        outcomes: broadcast::Sender<DeliveryOutcome>,
    ) -> Self {
        Self {
            inner: Arc::new(PartitionInner {
                topic,
                id,
                config,
                ledger,
                outcomes,
                state: Mutex::new(PartitionState::new()),
                wake: Notify::new(),
                space: Notify::new(),
                resolved: Notify::new(),
            }),
        }
    }

    /// Topic the partition belongs to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Partition identifier within the topic.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Receives terminal delivery outcomes of this partition (and, for
    /// partitions created by a partitioner, its sibling partitions).
    #[must_use]
    pub fn outcomes(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Dedup ledger consulted by exactly-once subscriptions.
    #[must_use]
    pub fn ledger(&self) -> &DedupLedger {
        &self.inner.ledger
    }

    /// Number of messages waiting to be dispatched.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.inner.state.lock().sequencer.len()
    }

    /// Number of messages dispatched and not yet resolved.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight()
    }

    /// Whether a handler is registered.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.inner.state.lock().subscription.is_some()
    }

    /// Whether the partition is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Closed
    }

    /// Current default ordering key.
    #[must_use]
    pub fn ordering_key(&self) -> Option<Bytes> {
        self.inner.state.lock().ordering_key.clone()
    }

    /// Largest payload a publish currently accepts.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.inner
            .state
            .lock()
            .max_message_size(self.inner.config.max_message_size)
    }

    /// Publishes an already built message.
    ///
    /// Without an explicit `ordering_key` the partition's current ordering key
    /// is used.
    ///
    /// # Errors
    /// `PartitionClosed` once closing, `MessageTooLarge` for oversize
    /// payloads, and `BacklogFull` or `PartitionDraining` under
    /// [`BacklogPolicy::FailFast`].
    pub async fn publish_message(
        &self,
        message: Message,
        ordering_key: Option<Bytes>,
    ) -> Result<MessageId, Error> {
        let message_id = message.message_id.clone();
        self.publish_batch(vec![message], ordering_key).await?;

        Ok(message_id)
    }

    /// Publishes `messages` as a unit: either all of them are appended, in
    /// order, or none are.
    ///
    /// Messages waiting for dispatch and messages in flight both count
    /// against `backlog_size`. A batch larger than `backlog_size` can never
    /// fit and fails with `BacklogFull` under either policy.
    ///
    /// # Errors
    /// As [`publish_message`](Self::publish_message).
    pub async fn publish_batch(
        &self,
        messages: Vec<Message>,
        ordering_key: Option<Bytes>,
    ) -> Result<Vec<MessageId>, Error> {
        let inner = &self.inner;
        let backlog_size = inner.config.backlog_size;

        loop {
            let space = inner.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = inner.state.lock();

                if state.closing || state.lifecycle == Lifecycle::Closed {
                    return Err(Error::PartitionClosed);
                }

                let limit = state.max_message_size(inner.config.max_message_size);
                if let Some(message) = messages.iter().find(|message| message.len() > limit) {
                    return Err(Error::MessageTooLarge {
                        size: message.len(),
                        limit,
                    });
                }

                let pending = state.backlog();
                if messages.len() > backlog_size {
                    return Err(Error::BacklogFull(pending));
                }

                let blocked = if state.lifecycle == Lifecycle::Draining {
                    Some(Error::PartitionDraining)
                } else if pending + messages.len() > backlog_size {
                    Some(Error::BacklogFull(pending))
                } else {
                    None
                };

                match blocked {
                    None => {
                        let ordering_key = ordering_key.or_else(|| state.ordering_key.clone());
                        let mut message_ids = Vec::with_capacity(messages.len());
                        for message in messages {
                            let message_id = message.message_id.clone();
                            let seq = state.sequencer.push(message, ordering_key.clone());
                            debug!(
                                "Published {} to {}/{} at seq {}",
                                message_id, inner.topic, inner.id, seq
                            );
                            message_ids.push(message_id);
                        }
                        drop(state);

                        inner.wake.notify_one();
                        return Ok(message_ids);
                    }
                    Some(error) if inner.config.backlog_policy == BacklogPolicy::FailFast => {
                        return Err(error);
                    }
                    Some(_) => {}
                }
            }

            space.await;
        }
    }

    /// Registers a shared handler. Used by topic subscriptions, which attach
    /// one handler to many partitions.
    pub(crate) fn attach(
        &self,
        handler: Arc<dyn BatchHandler>,
        metadata: SubscriberMetadata,
        options: SubscriptionOptions,
        acks: AckReceiver,
    ) -> Result<(), Error> {
        let inner = &self.inner;

        let (generation, cancel, work) = {
            let mut state = inner.state.lock();

            if let Some(error) = state.unavailable() {
                return Err(error);
            }
            if state.subscription.is_some() {
                return Err(Error::AlreadySubscribed);
            }

            if options.delivery_guarantee == DeliveryGuarantee::ExactlyOnce {
                inner.ledger.ensure_retention(options.redelivery_span());
            }

            for item in state.sequencer.remove_oversize(options.max_message_size) {
                inner.report(
                    &item.message.message_id,
                    item.deliveries,
                    DeliveryStatus::Failed {
                        reason: FailureReason::MessageTooLarge,
                        last_error: None,
                    },
                );
            }

            info!(
                "Subscriber {} attached to {}/{} with {:?}",
                metadata.subscriber_id, inner.topic, inner.id, options.delivery_guarantee
            );

            state.generation += 1;
            let generation = state.generation;
            let cancel = CancellationToken::new();
            let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_DEPTH);

            state.subscription = Some(ActiveSubscription {
                generation,
                metadata,
                tracker: AckTracker::new(options),
                work: work_tx,
                overflow: VecDeque::new(),
                cancel: cancel.clone(),
            });

            (generation, cancel, work_rx)
        };

        tokio::spawn(driver::run_driver(
            Arc::clone(inner),
            generation,
            acks,
            cancel.clone(),
        ));
        tokio::spawn(driver::run_worker(Arc::clone(inner), handler, work, cancel));

        inner.space.notify_waiters();

        Ok(())
    }
}

#[async_trait]
impl Partition for MemoryPartition {
    type Error = Error;

    async fn subscribe<H>(
        &self,
        handler: H,
        metadata: SubscriberMetadata,
        options: SubscriptionOptions,
        acks: AckReceiver,
    ) -> Result<(), Self::Error>
    where
        H: BatchHandler,
    {
        self.attach(Arc::new(handler), metadata, options, acks)
    }

    async fn unsubscribe(&self) -> Result<(), Self::Error> {
        let inner = &self.inner;

        {
            let mut state = inner.state.lock();

            if let Some(error) = state.unavailable() {
                return Err(error);
            }
            let Some(subscription) = state.subscription.as_ref() else {
                return Err(Error::NotSubscribed);
            };

            info!(
                "Subscriber {} detaching from {}/{}",
                subscription.metadata.subscriber_id, inner.topic, inner.id
            );

            state.lifecycle = Lifecycle::Draining;
            inner.requeue_unhanded(&mut state);
        }

        inner.wait_for_inflight().await;

        {
            let mut state = inner.state.lock();

            // A concurrent close finishes the transition instead.
            if !state.closing {
                if let Some(subscription) = state.subscription.take() {
                    subscription.cancel.cancel();

                    let mut tracker = subscription.tracker;
                    for delivery in tracker.drain() {
                        let (key, item) = delivery.into_sequenced();
                        state.sequencer.release(&key);
                        state.sequencer.requeue(key, item);
                    }
                }
                state.lifecycle = Lifecycle::Open;
            }
        }

        inner.space.notify_waiters();
        info!("Unsubscribed from {}/{}", inner.topic, inner.id);

        Ok(())
    }

    async fn publish(
        &self,
        value: Bytes,
        mut metadata: PublishMetadata,
        ordering_key: Option<Bytes>,
    ) -> Result<MessageId, Self::Error> {
        let ordering_key = ordering_key.or_else(|| metadata.ordering_key.take());
        self.publish_message(metadata.into_message(value), ordering_key)
            .await
    }

    async fn set_ordering_key(&self, ordering_key: Option<Bytes>) -> Result<(), Self::Error> {
        let mut state = self.inner.state.lock();

        if state.closing || state.lifecycle == Lifecycle::Closed {
            return Err(Error::PartitionClosed);
        }
        state.ordering_key = ordering_key;

        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        let inner = &self.inner;

        {
            let mut state = inner.state.lock();

            if state.closing || state.lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            state.closing = true;
            state.lifecycle = Lifecycle::Draining;
            inner.requeue_unhanded(&mut state);
        }

        // Blocked publishers observe `closing` and give up.
        inner.space.notify_waiters();
        inner.wait_for_inflight().await;

        {
            let mut state = inner.state.lock();
            state.lifecycle = Lifecycle::Closed;

            if let Some(subscription) = state.subscription.take() {
                subscription.cancel.cancel();

                let mut tracker = subscription.tracker;
                for delivery in tracker.drain() {
                    inner.report(
                        &delivery.message.message_id,
                        delivery.deliveries,
                        DeliveryStatus::Failed {
                            reason: FailureReason::SubscriptionClosed,
                            last_error: delivery.last_error,
                        },
                    );
                }
            }

            for item in state.sequencer.drain_all() {
                inner.report(
                    &item.message.message_id,
                    item.deliveries,
                    DeliveryStatus::Failed {
                        reason: FailureReason::SubscriptionClosed,
                        last_error: None,
                    },
                );
            }
        }

        inner.space.notify_waiters();
        inner.resolved.notify_waiters();
        info!("Closed partition {}/{}", inner.topic, inner.id);

        Ok(())
    }
}

impl PartitionInner {
    /// Moves ready batches from the sequencer to the delivery worker.
    fn dispatch(&self, generation: u64) {
        let mut state = self.state.lock();
        if !state.is_open() {
            return;
        }

        let PartitionState {
            sequencer,
            subscription,
            ..
        } = &mut *state;
        let Some(subscription) = subscription
            .as_mut()
            .filter(|subscription| subscription.generation == generation)
        else {
            return;
        };

        let guarantee = subscription.tracker.options().delivery_guarantee;
        let coupled = guarantee.requires_ordered_completion();
        let exactly_once = guarantee == DeliveryGuarantee::ExactlyOnce;

        let mut released = false;
        while subscription.flush() {
            let Some(batch) = sequencer.next_batch(coupled, self.config.max_batch_size) else {
                break;
            };

            let mut copies = Vec::with_capacity(batch.items.len());
            for item in batch.items {
                // Already processed within the dedup window: never hand it out again.
                if exactly_once && self.ledger.contains(&item.message.message_id) {
                    released = true;
                    sequencer.release(&batch.key);
                    self.report(
                        &item.message.message_id,
                        item.deliveries,
                        DeliveryStatus::Deduplicated,
                    );
                    continue;
                }

                match subscription.tracker.track(batch.key.clone(), item) {
                    Ok(copy) => copies.push(copy),
                    Err(duplicate) => {
                        released = true;
                        sequencer.release(&batch.key);
                        self.report(
                            &duplicate.message.message_id,
                            duplicate.deliveries,
                            DeliveryStatus::Deduplicated,
                        );
                    }
                }
            }

            if !copies.is_empty() {
                debug!(
                    "Dispatching {} messages on {}/{}",
                    copies.len(),
                    self.topic,
                    self.id
                );
                subscription.enqueue(WorkItem { generation, copies });
            }
        }

        drop(state);
        if released {
            self.space.notify_waiters();
        }
    }

    fn handle_ack(&self, generation: u64, ack: AckMessage) {
        let mut state = self.state.lock();
        let draining = !state.is_open();

        let PartitionState {
            sequencer,
            subscription,
            ..
        } = &mut *state;
        let Some(subscription) = subscription
            .as_mut()
            .filter(|subscription| subscription.generation == generation)
        else {
            return;
        };

        let message_id = ack.message_id.clone();
        let resolution = subscription.tracker.on_ack(ack, draining, &self.ledger);
        if matches!(resolution, Resolution::Ignored) {
            debug!(
                "Ignoring ack for {} on {}/{}",
                message_id, self.topic, self.id
            );
            return;
        }

        let mut redeliveries = Redeliveries::new();
        self.apply(sequencer, resolution, &mut redeliveries);
        Self::send_redeliveries(subscription, redeliveries);

        drop(state);
        self.space.notify_waiters();
        if draining {
            self.resolved.notify_waiters();
        }
    }

    /// Expires deliveries whose ack deadline has passed.
    fn sweep(&self, generation: u64) {
        let mut state = self.state.lock();
        let draining = !state.is_open();

        let PartitionState {
            sequencer,
            subscription,
            ..
        } = &mut *state;
        let Some(subscription) = subscription
            .as_mut()
            .filter(|subscription| subscription.generation == generation)
        else {
            return;
        };

        let resolutions = subscription
            .tracker
            .expire(Instant::now(), draining, &self.ledger);
        if resolutions.is_empty() {
            return;
        }

        let mut redeliveries = Redeliveries::new();
        for resolution in resolutions {
            self.apply(sequencer, resolution, &mut redeliveries);
        }
        Self::send_redeliveries(subscription, redeliveries);

        drop(state);
        self.space.notify_waiters();
        if draining {
            self.resolved.notify_waiters();
        }
    }

    fn apply(&self, sequencer: &mut Sequencer, resolution: Resolution, redeliveries: &mut Redeliveries) {
        match resolution {
            Resolution::Resolved { delivery, status } => {
                sequencer.release(&delivery.key);
                self.report(&delivery.message.message_id, delivery.deliveries, status);
            }
            Resolution::Redeliver { key, copy } => {
                debug!(
                    "Redelivering {} on {}/{} (attempt {})",
                    copy.message.message_id, self.topic, self.id, copy.attempt
                );
                match redeliveries.iter_mut().find(|(lane, _)| *lane == key) {
                    Some((_, copies)) => copies.push(copy),
                    None => redeliveries.push((key, vec![copy])),
                }
            }
            Resolution::Requeue(delivery) => {
                let (key, item) = delivery.into_sequenced();
                sequencer.release(&key);
                sequencer.requeue(key, item);
            }
            Resolution::Ignored => {}
        }
    }

    fn send_redeliveries(subscription: &mut ActiveSubscription, redeliveries: Redeliveries) {
        for (_, copies) in redeliveries {
            let item = WorkItem {
                generation: subscription.generation,
                copies,
            };
            subscription.enqueue(item);
        }
    }

    /// Marks the copies of `item` that may still reach the handler as handed
    /// off and returns their messages.
    fn begin_handoff(&self, item: WorkItem) -> Vec<Message> {
        let mut state = self.state.lock();
        let Some(subscription) = state
            .subscription
            .as_mut()
            .filter(|subscription| subscription.generation == item.generation)
        else {
            return Vec::new();
        };

        let now = Instant::now();
        item.copies
            .into_iter()
            .filter(|copy| {
                let accepted =
                    subscription
                        .tracker
                        .hand_off(&copy.message.message_id, copy.attempt, now);
                if !accepted {
                    debug!(
                        "Skipping stale copy of {} on {}/{}",
                        copy.message.message_id, self.topic, self.id
                    );
                }
                accepted
            })
            .map(|copy| copy.message)
            .collect()
    }

    /// Returns dispatched copies that never reached the handler to the
    /// sequencer.
    fn requeue_unhanded(&self, state: &mut PartitionState) {
        let PartitionState {
            sequencer,
            subscription,
            ..
        } = state;
        let Some(subscription) = subscription.as_mut() else {
            return;
        };

        let unhanded = subscription.tracker.take_unhanded();
        if !unhanded.is_empty() {
            debug!(
                "Requeueing {} undelivered messages on {}/{}",
                unhanded.len(),
                self.topic,
                self.id
            );
        }
        for delivery in unhanded {
            let (key, item) = delivery.into_sequenced();
            sequencer.release(&key);
            sequencer.requeue(key, item);
        }
    }

    /// Waits until nothing is in flight or the drain grace elapses.
    async fn wait_for_inflight(&self) {
        let deadline = Instant::now() + self.config.drain_grace;

        loop {
            let resolved = self.resolved.notified();
            tokio::pin!(resolved);
            resolved.as_mut().enable();

            let remaining = self.state.lock().in_flight();
            if remaining == 0 {
                return;
            }

            if tokio::time::timeout_at(deadline, resolved).await.is_err() {
                debug!(
                    "Drain grace elapsed on {}/{} with {} in flight",
                    self.topic, self.id, remaining
                );
                return;
            }
        }
    }

    fn report(&self, message_id: &MessageId, attempts: u32, status: DeliveryStatus) {
        match &status {
            DeliveryStatus::Failed { reason, last_error } => warn!(
                "Delivery of {} on {}/{} failed after {} attempts: {} (last error: {:?})",
                message_id, self.topic, self.id, attempts, reason, last_error
            ),
            status => debug!(
                "Delivery of {} on {}/{} resolved: {:?}",
                message_id, self.topic, self.id, status
            ),
        }

        // No receivers is fine.
        let _ = self.outcomes.send(DeliveryOutcome {
            topic: self.topic.clone(),
            partition_id: self.id,
            message_id: message_id.clone(),
            attempts,
            status,
        });
    }
}
