//! Abstract interface for a partitioned publish/subscribe core.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Handlers receive batches of messages from partitions.
pub mod handler;

/// Messages and acknowledgements.
pub mod message;

/// Metadata supplied with publishes and subscriptions.
pub mod metadata;

/// Subscription options and delivery guarantees.
pub mod options;

/// Terminal delivery outcomes.
pub mod outcome;

/// Partitions are ordered shards of a topic.
pub mod partition;

/// Partitioners map topics and keys to partitions.
pub mod partitioner;

/// Publishers send messages to topics.
pub mod publisher;

/// Subscribers attach handlers to topics.
pub mod subscriber;

pub use handler::BatchHandler;
pub use message::{AckMessage, Message, MessageId};
pub use metadata::{Headers, PublishMetadata, SubscriberMetadata};
pub use options::{DeliveryGuarantee, SubscriptionOptions};
pub use outcome::{DeliveryOutcome, DeliveryStatus, FailureReason};
pub use partition::{Partition, PartitionError};
pub use partitioner::{Partitioner, PartitionerError};
pub use publisher::{Publisher, PublisherError};
pub use subscriber::{Subscriber, SubscriberError};

use std::error::Error;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Sending half of an ack channel, held by the subscriber.
pub type AckSender = mpsc::Sender<AckMessage>;

/// Receiving half of an ack channel, handed to `subscribe`.
pub type AckReceiver = mpsc::Receiver<AckMessage>;

/// Creates a bounded ack channel.
#[must_use]
pub fn ack_channel(capacity: usize) -> (AckSender, AckReceiver) {
    mpsc::channel(capacity)
}

/// Marker trait for pub/sub errors
pub trait PubSubError: Error + Send + Sync + 'static {}

/// A partitioned publish/subscribe system.
#[async_trait]
pub trait PubSub
where
    Self: Publisher + Subscriber,
{
    /// The error type for the system.
    type Error: PubSubError;

    /// The partitioner type.
    type Partitioner: Partitioner;

    /// Returns the partitioner responsible for placing messages.
    fn partitioner(&self) -> Self::Partitioner;

    /// Closes the system and every partition in it.
    async fn close(&self) -> Result<(), <Self as PubSub>::Error>;
}
