use crate::handler::BatchHandler;
use crate::message::MessageId;
use crate::metadata::{PublishMetadata, SubscriberMetadata};
use crate::options::SubscriptionOptions;
use crate::AckReceiver;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for partition errors
pub trait PartitionError: Error + Send + Sync + 'static {}

/// An ordered, independently scheduled shard of a topic.
#[async_trait]
pub trait Partition
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the partition.
    type Error: PartitionError;

    /// Registers the handler for this partition.
    ///
    /// The handler is called with batches of messages, ordered by ordering
    /// key. Acknowledgements are read from `acks`.
    async fn subscribe<H>(
        &self,
        handler: H,
        metadata: SubscriberMetadata,
        options: SubscriptionOptions,
        acks: AckReceiver,
    ) -> Result<(), Self::Error>
    where
        H: BatchHandler;

    /// Removes the handler, letting in-flight deliveries finish first.
    async fn unsubscribe(&self) -> Result<(), Self::Error>;

    /// Publishes a message to this partition.
    ///
    /// If `ordering_key` is `None` the partition's current ordering key is used.
    async fn publish(
        &self,
        value: Bytes,
        metadata: PublishMetadata,
        ordering_key: Option<Bytes>,
    ) -> Result<MessageId, Self::Error>;

    /// Sets the ordering key used for subsequent publishes without an explicit key.
    async fn set_ordering_key(&self, ordering_key: Option<Bytes>) -> Result<(), Self::Error>;

    /// Closes the partition. Further operations fail.
    async fn close(&self) -> Result<(), Self::Error>;
}
