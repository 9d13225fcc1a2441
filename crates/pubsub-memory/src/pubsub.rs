use std::sync::Arc;

use async_trait::async_trait;
use proven_pubsub::{
    AckReceiver, BatchHandler, DeliveryOutcome, Message, Partitioner, PubSub, PublishMetadata,
    Publisher, SubscriberMetadata, Subscriber, SubscriptionOptions,
};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::MemoryPubSubConfig;
use crate::partitioner::MemoryPartitioner;
use crate::Error;

/// In-memory partitioned pub/sub.
#[derive(Clone, Debug)]
pub struct MemoryPubSub {
    partitioner: MemoryPartitioner,
}

impl MemoryPubSub {
    /// Creates a new instance of `MemoryPubSub`.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` if the configuration is unusable.
    pub fn new(config: MemoryPubSubConfig) -> Result<Self, Error> {
        Ok(Self {
            partitioner: MemoryPartitioner::new(config)?,
        })
    }

    /// Receives terminal delivery outcomes from every partition.
    #[must_use]
    pub fn outcomes(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.partitioner.outcomes()
    }

    /// Closes every topic subscription and partition, giving in-flight
    /// deliveries the configured drain grace to resolve. Idempotent.
    ///
    /// # Errors
    /// Currently infallible; partitions that fail to close are logged.
    pub async fn close(&self) -> Result<(), Error> {
        info!("Closing pub/sub");
        Partitioner::close(&self.partitioner).await
    }
}

#[async_trait]
impl Publisher for MemoryPubSub {
    type Error = Error;

    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        messages: Vec<Message>,
        metadata: PublishMetadata,
    ) -> Result<(), Self::Error> {
        let partition = self.partitioner.get_or_create(topic, key)?;

        let messages = messages
            .into_iter()
            .map(|message| metadata.apply_to(message))
            .collect();
        partition
            .publish_batch(messages, metadata.ordering_key)
            .await?;

        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        MemoryPubSub::close(self).await
    }
}

#[async_trait]
impl Subscriber for MemoryPubSub {
    type Error = Error;

    async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        metadata: SubscriberMetadata,
        options: SubscriptionOptions,
        acks: AckReceiver,
    ) -> Result<(), Self::Error>
    where
        H: BatchHandler,
    {
        self.partitioner
            .subscribe_topic(topic, Arc::new(handler), metadata, options, acks)
            .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error> {
        self.partitioner.unsubscribe_topic(topic).await
    }

    async fn close(&self) -> Result<(), Self::Error> {
        MemoryPubSub::close(self).await
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    type Error = Error;
    type Partitioner = MemoryPartitioner;

    fn partitioner(&self) -> Self::Partitioner {
        self.partitioner.clone()
    }

    async fn close(&self) -> Result<(), <Self as PubSub>::Error> {
        Self::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let config = MemoryPubSubConfig {
            partitions_per_topic: 0,
            ..MemoryPubSubConfig::default()
        };

        assert_eq!(
            MemoryPubSub::new(config).unwrap_err(),
            Error::InvalidConfig("partitions_per_topic must be non-zero".to_string())
        );
    }

    #[tokio::test]
    async fn test_publish_to_empty_topic() {
        let pubsub = MemoryPubSub::new(MemoryPubSubConfig::default()).unwrap();

        let result = pubsub
            .publish("", b"key", vec![Message::from("a")], PublishMetadata::default())
            .await;

        assert_eq!(result, Err(Error::InvalidTopic));
    }

    #[tokio::test]
    async fn test_partitioner_shared() {
        let pubsub = MemoryPubSub::new(MemoryPubSubConfig::default()).unwrap();

        pubsub
            .publish("orders", b"alice", vec![Message::from("a")], PublishMetadata::default())
            .await
            .unwrap();

        let partitioner = pubsub.partitioner();
        assert_eq!(partitioner.partition_count(), 1);
        assert_eq!(partitioner.topics(), vec!["orders".to_string()]);
        assert_eq!(partitioner.partitions("orders")[0].backlog_len(), 1);
    }
}
