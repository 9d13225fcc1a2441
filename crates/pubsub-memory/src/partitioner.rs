use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use proven_pubsub::{
    AckReceiver, BatchHandler, DeliveryOutcome, Partition, Partitioner, SubscriberMetadata,
    SubscriptionOptions,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

use crate::config::MemoryPubSubConfig;
use crate::ledger::DedupLedger;
use crate::partition::MemoryPartition;
use crate::routing::TopicSubscription;
use crate::Error;

#[derive(Debug, Default)]
struct Topic {
    partitions: BTreeMap<u64, MemoryPartition>,
    subscription: Option<TopicSubscription>,
}

#[derive(Debug)]
struct PartitionerInner {
    config: MemoryPubSubConfig,
    topics: DashMap<String, Topic>,
    partition_count: AtomicUsize,
    ledger: DedupLedger,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    closed: AtomicBool,
}

/// Maps topics and keys to in-memory partitions, creating them on first use.
#[derive(Clone, Debug)]
pub struct MemoryPartitioner {
    inner: Arc<PartitionerInner>,
}

impl MemoryPartitioner {
    /// Creates a partitioner.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` if the configuration is unusable.
    pub fn new(config: MemoryPubSubConfig) -> Result<Self, Error> {
        config.validate()?;

        let (outcomes, _) = broadcast::channel(config.partition.outcome_buffer);
        let ledger = DedupLedger::new(config.dedup.clone());

        Ok(Self {
            inner: Arc::new(PartitionerInner {
                config,
                topics: DashMap::new(),
                partition_count: AtomicUsize::new(0),
                ledger,
                outcomes,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Partition identifier `key` maps to within a topic.
    #[must_use]
    pub fn partition_id(&self, key: &[u8]) -> u64 {
        XxHash64::oneshot(0, key) % u64::from(self.inner.config.partitions_per_topic)
    }

    /// Returns the partition for `key` on `topic`, creating it if needed.
    ///
    /// Concurrent callers for the same partition always receive the same
    /// instance.
    ///
    /// # Errors
    /// `Closed` after `close`, `InvalidTopic` for an empty topic, and
    /// `PartitionLimitExceeded` when creating the partition would exceed
    /// `max_partitions`.
    pub fn get_or_create(&self, topic: &str, key: &[u8]) -> Result<MemoryPartition, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if topic.is_empty() {
            return Err(Error::InvalidTopic);
        }

        let partition_id = self.partition_id(key);

        if let Some(partition) = self
            .inner
            .topics
            .get(topic)
            .and_then(|topic| topic.partitions.get(&partition_id).cloned())
        {
            return Ok(partition);
        }

        let mut entry = self.inner.topics.entry(topic.to_string()).or_default();

        if let Some(partition) = entry.partitions.get(&partition_id) {
            return Ok(partition.clone());
        }

        // Checked again under the entry lock so `close` cannot miss a
        // partition created concurrently.
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let max_partitions = self.inner.config.max_partitions;
        if self
            .inner
            .partition_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < max_partitions).then_some(count + 1)
            })
            .is_err()
        {
            return Err(Error::PartitionLimitExceeded(max_partitions));
        }

        let partition = MemoryPartition::with_shared(
            topic.to_string(),
            partition_id,
            self.inner.config.partition.clone(),
            self.inner.ledger.clone(),
            self.inner.outcomes.clone(),
        );

        if let Some(subscription) = &entry.subscription {
            if let Err(error) = subscription.attach(&partition) {
                warn!(
                    "Failed to attach topic subscriber to {}/{}: {}",
                    topic, partition_id, error
                );
            }
        }

        entry.partitions.insert(partition_id, partition.clone());
        debug!("Created partition {}/{}", topic, partition_id);

        Ok(partition)
    }

    /// Partitions of `topic` created so far, ordered by id.
    #[must_use]
    pub fn partitions(&self, topic: &str) -> Vec<MemoryPartition> {
        self.inner
            .topics
            .get(topic)
            .map(|topic| topic.partitions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages delivered through the topic subscription of `topic` that are
    /// not yet resolved.
    #[must_use]
    pub fn pending_routes(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .and_then(|topic| topic.subscription.as_ref().map(TopicSubscription::pending_routes))
            .unwrap_or(0)
    }

    /// Names of all topics with at least one partition or subscription.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .inner
            .topics
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    /// Number of partitions across all topics.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.inner.partition_count.load(Ordering::SeqCst)
    }

    /// Receives terminal delivery outcomes from every partition.
    #[must_use]
    pub fn outcomes(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Dedup ledger shared by every partition.
    #[must_use]
    pub fn ledger(&self) -> &DedupLedger {
        &self.inner.ledger
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Attaches `handler` to every current and future partition of `topic`.
    ///
    /// # Errors
    /// `InvalidTopic`, `Closed`, `AlreadySubscribed` if the topic or one of
    /// its partitions already has a subscriber.
    pub async fn subscribe_topic(
        &self,
        topic: &str,
        handler: Arc<dyn BatchHandler>,
        metadata: SubscriberMetadata,
        options: SubscriptionOptions,
        acks: AckReceiver,
    ) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if topic.is_empty() {
            return Err(Error::InvalidTopic);
        }

        let failure = {
            let mut entry = self.inner.topics.entry(topic.to_string()).or_default();
            if entry.subscription.is_some() {
                return Err(Error::AlreadySubscribed);
            }

            let subscription = TopicSubscription::start(
                topic,
                handler,
                metadata.clone(),
                options,
                acks,
                self.inner.outcomes.subscribe(),
            );

            let mut attached = Vec::new();
            let mut failure = None;
            for partition in entry.partitions.values() {
                match subscription.attach(partition) {
                    Ok(()) => attached.push(partition.clone()),
                    Err(error) => {
                        failure = Some((error, attached));
                        break;
                    }
                }
            }

            match failure {
                None => {
                    info!(
                        "Subscriber {} attached to topic {} ({} partitions)",
                        metadata.subscriber_id,
                        topic,
                        entry.partitions.len()
                    );
                    entry.subscription = Some(subscription);
                    None
                }
                Some(failure) => {
                    subscription.stop();
                    Some(failure)
                }
            }
        };

        let Some((error, attached)) = failure else {
            return Ok(());
        };

        warn!("Subscribing to topic {} failed: {}", topic, error);
        for partition in attached {
            if let Err(error) = partition.unsubscribe().await {
                debug!(
                    "Rolling back {}/{} failed: {}",
                    topic,
                    partition.id(),
                    error
                );
            }
        }

        Err(error)
    }

    /// Detaches the topic subscriber from every partition of `topic`.
    ///
    /// # Errors
    /// `NotSubscribed` if the topic has no subscriber.
    pub async fn unsubscribe_topic(&self, topic: &str) -> Result<(), Error> {
        let (subscription, partitions) = {
            let Some(mut entry) = self.inner.topics.get_mut(topic) else {
                return Err(Error::NotSubscribed);
            };
            let Some(subscription) = entry.subscription.take() else {
                return Err(Error::NotSubscribed);
            };
            let partitions: Vec<MemoryPartition> = entry.partitions.values().cloned().collect();
            (subscription, partitions)
        };

        let results = join_all(partitions.iter().map(|partition| partition.unsubscribe())).await;
        for (partition, result) in partitions.iter().zip(results) {
            match result {
                Ok(()) | Err(Error::NotSubscribed | Error::PartitionClosed) => {}
                Err(error) => warn!(
                    "Unsubscribing {}/{} failed: {}",
                    topic,
                    partition.id(),
                    error
                ),
            }
        }

        info!(
            "Unsubscribed from topic {} ({} unacknowledged routes dropped)",
            topic,
            subscription.pending_routes()
        );
        subscription.stop();

        Ok(())
    }
}

#[async_trait]
impl Partitioner for MemoryPartitioner {
    type Error = Error;
    type Partition = MemoryPartition;

    async fn partition(&self, topic: &str, key: &[u8]) -> Result<Self::Partition, Self::Error> {
        self.get_or_create(topic, key)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut subscriptions = Vec::new();
        let mut partitions = Vec::new();
        for mut topic in self.inner.topics.iter_mut() {
            subscriptions.extend(topic.subscription.take());
            partitions.extend(topic.partitions.values().cloned());
        }

        for subscription in &subscriptions {
            subscription.stop();
        }

        info!("Closing {} partitions", partitions.len());

        let results = join_all(partitions.iter().map(|partition| partition.close())).await;
        for (partition, result) in partitions.iter().zip(results) {
            if let Err(error) = result {
                warn!(
                    "Closing {}/{} failed: {}",
                    partition.topic(),
                    partition.id(),
                    error
                );
            }
        }

        info!("Partitioner closed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    fn partitioner(partitions_per_topic: u32, max_partitions: usize) -> MemoryPartitioner {
        MemoryPartitioner::new(MemoryPubSubConfig {
            partitions_per_topic,
            max_partitions,
            ..MemoryPubSubConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let partitioner = partitioner(64, 16);

        let first = partitioner.partition("orders", b"alice").await.unwrap();
        let second = partitioner.partition("orders", b"alice").await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.id(), partitioner.partition_id(b"alice"));
        assert_eq!(partitioner.partition_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let partitioner = partitioner(64, 16);
        assert_eq!(
            partitioner.partition("", b"alice").await.unwrap_err(),
            Error::InvalidTopic
        );
    }

    #[tokio::test]
    async fn test_partition_limit() {
        let partitioner = partitioner(1, 1);

        partitioner.partition("a", b"key").await.unwrap();
        assert_eq!(
            partitioner.partition("b", b"key").await.unwrap_err(),
            Error::PartitionLimitExceeded(1)
        );
        // Existing partitions are still handed out.
        assert!(partitioner.partition("a", b"other").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_resolves_to_one_partition() {
        let partitioner = partitioner(64, 64);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let partitioner = partitioner.clone();
                tokio::spawn(async move { partitioner.partition("orders", b"alice").await })
            })
            .collect();

        let mut partitions = Vec::new();
        for handle in handles {
            partitions.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(partitioner.partition_count(), 1);

        // Every caller got a handle to the same partition.
        partitions[0]
            .set_ordering_key(Some(bytes::Bytes::from("k")))
            .await
            .unwrap();
        assert!(
            partitions
                .iter()
                .all(|partition| partition.ordering_key() == Some(bytes::Bytes::from("k")))
        );
    }

    #[tokio::test]
    async fn test_keys_spread_over_partitions() {
        let partitioner = partitioner(8, 64);

        let ids: HashSet<u64> = (0..64u32)
            .map(|i| partitioner.partition_id(&i.to_be_bytes()))
            .collect();

        assert!(ids.len() > 1);
        assert!(ids.iter().all(|id| *id < 8));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let partitioner = partitioner(64, 16);
        let partition = partitioner.partition("orders", b"alice").await.unwrap();

        partitioner.close().await.unwrap();
        partitioner.close().await.unwrap();

        assert!(partition.is_closed());
        assert_eq!(
            partitioner.partition("orders", b"alice").await.unwrap_err(),
            Error::Closed
        );
    }
}
