//! Topic-level subscriptions.
//!
//! A topic subscription attaches one handler to every partition of a topic.
//! The subscriber acks on a single channel, so each ack has to be routed back
//! to the partition that delivered the message.

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use proven_pubsub::{
    ack_channel, AckMessage, AckReceiver, AckSender, BatchHandler, DeliveryOutcome, Message,
    MessageId, SubscriberMetadata, SubscriptionOptions,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::partition::MemoryPartition;
use crate::Error;

/// Capacity of the ack channel between the router and each partition.
const PARTITION_ACK_BUFFER: usize = 1024;

type Routes = Arc<DashMap<MessageId, u64>>;
type Senders = Arc<DashMap<u64, AckSender>>;

/// Records which partition delivered each message before passing the batch
/// on.
struct RoutingHandler {
    partition_id: u64,
    routes: Routes,
    inner: Arc<dyn BatchHandler>,
}

#[async_trait]
impl BatchHandler for RoutingHandler {
    async fn deliver(&self, batch: Vec<Message>) {
        for message in &batch {
            self.routes
                .insert(message.message_id.clone(), self.partition_id);
        }

        self.inner.deliver(batch).await;
    }
}

/// A handler attached to every partition of one topic.
pub struct TopicSubscription {
    topic: String,
    handler: Arc<dyn BatchHandler>,
    metadata: SubscriberMetadata,
    options: SubscriptionOptions,
    routes: Routes,
    senders: Senders,
    cancel: CancellationToken,
}

impl Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topic", &self.topic)
            .field("subscriber_id", &self.metadata.subscriber_id)
            .field("partitions", &self.senders.len())
            .finish_non_exhaustive()
    }
}

impl TopicSubscription {
    /// Starts routing acks read from `acks`.
    ///
    /// Routes are dropped on a success ack or when `outcomes` reports the
    /// message as resolved.
    pub fn start(
        topic: &str,
        handler: Arc<dyn BatchHandler>,
        metadata: SubscriberMetadata,
        options: SubscriptionOptions,
        acks: AckReceiver,
        outcomes: broadcast::Receiver<DeliveryOutcome>,
    ) -> Self {
        let subscription = Self {
            topic: topic.to_string(),
            handler,
            metadata,
            options,
            routes: Arc::new(DashMap::new()),
            senders: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        };

        tokio::spawn(route_acks(
            subscription.topic.clone(),
            acks,
            outcomes,
            Arc::clone(&subscription.routes),
            Arc::clone(&subscription.senders),
            subscription.cancel.clone(),
        ));

        subscription
    }

    /// Attaches the handler to `partition`.
    ///
    /// # Errors
    /// Fails as [`MemoryPartition`] subscribe does, e.g. `AlreadySubscribed`.
    pub fn attach(&self, partition: &MemoryPartition) -> Result<(), Error> {
        let (sender, receiver) = ack_channel(PARTITION_ACK_BUFFER);

        let handler = RoutingHandler {
            partition_id: partition.id(),
            routes: Arc::clone(&self.routes),
            inner: Arc::clone(&self.handler),
        };

        partition.attach(
            Arc::new(handler),
            self.metadata.clone(),
            self.options.clone(),
            receiver,
        )?;
        self.senders.insert(partition.id(), sender);

        Ok(())
    }

    /// Stops routing acks. Routes still pending are dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.senders.clear();
        self.routes.clear();
    }

    /// Number of delivered messages that are not yet resolved.
    #[must_use]
    pub fn pending_routes(&self) -> usize {
        self.routes.len()
    }
}

async fn route_acks(
    topic: String,
    mut acks: AckReceiver,
    mut outcomes: broadcast::Receiver<DeliveryOutcome>,
    routes: Routes,
    senders: Senders,
    cancel: CancellationToken,
) {
    let mut outcomes_open = true;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            ack = acks.recv() => match ack {
                Some(ack) => forward_ack(&topic, ack, &routes, &senders).await,
                None => break,
            },
            outcome = outcomes.recv(), if outcomes_open => match outcome {
                Ok(outcome) => forget_resolved(&topic, &outcome, &routes),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Ack router for {} missed {} outcomes", topic, skipped);
                }
                Err(RecvError::Closed) => outcomes_open = false,
            },
        }
    }

    debug!("Ack router for {} stopped", topic);
}

async fn forward_ack(topic: &str, ack: AckMessage, routes: &Routes, senders: &Senders) {
    let partition_id = if ack.is_success() {
        routes.remove(&ack.message_id).map(|(_, id)| id)
    } else {
        routes.get(&ack.message_id).map(|id| *id)
    };

    let Some(partition_id) = partition_id else {
        debug!("Dropping ack for unknown message {} on {}", ack.message_id, topic);
        return;
    };

    let sender = senders.get(&partition_id).map(|sender| sender.clone());
    let Some(sender) = sender else {
        debug!("Partition {}/{} no longer subscribed", topic, partition_id);
        return;
    };

    if sender.send(ack).await.is_err() {
        debug!("Partition {}/{} stopped reading acks", topic, partition_id);
    }
}

/// Drops the route of a message its partition has finished with.
fn forget_resolved(topic: &str, outcome: &DeliveryOutcome, routes: &Routes) {
    // Never handed to a handler, so it has no route.
    if outcome.topic != topic || outcome.attempts == 0 {
        return;
    }

    routes.remove_if(&outcome.message_id, |_, partition_id| {
        *partition_id == outcome.partition_id
    });
}
