use crate::handler::BatchHandler;
use crate::metadata::SubscriberMetadata;
use crate::options::SubscriptionOptions;
use crate::AckReceiver;

use std::error::Error;

use async_trait::async_trait;

/// Marker trait for subscriber errors
pub trait SubscriberError: Error + Send + Sync + 'static {}

/// Subscribes handlers to whole topics.
#[async_trait]
pub trait Subscriber
where
    Self: Send + Sync + 'static,
{
    /// The error type for the subscriber.
    type Error: SubscriberError;

    /// Adds a handler for every partition of `topic`, including partitions
    /// created later.
    async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        metadata: SubscriberMetadata,
        options: SubscriptionOptions,
        acks: AckReceiver,
    ) -> Result<(), Self::Error>
    where
        H: BatchHandler;

    /// Removes the handler for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Closes the subscriber.
    async fn close(&self) -> Result<(), Self::Error>;
}
