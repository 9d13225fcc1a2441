use crate::message::Message;
use crate::metadata::PublishMetadata;

use std::error::Error;

use async_trait::async_trait;

/// Marker trait for publisher errors
pub trait PublisherError: Error + Send + Sync + 'static {}

/// Publishes messages to topics.
#[async_trait]
pub trait Publisher
where
    Self: Send + Sync + 'static,
{
    /// The error type for the publisher.
    type Error: PublisherError;

    /// Publishes `messages` to the partition of `topic` selected by `key`.
    ///
    /// The ordering key in `metadata` applies to every message. Its content
    /// type and correlation id fill the messages that leave them unset; the
    /// id and timestamp of each message are its own.
    ///
    /// The batch is all-or-nothing: on error none of `messages` is queued.
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        messages: Vec<Message>,
        metadata: PublishMetadata,
    ) -> Result<(), Self::Error>;

    /// Closes the publisher.
    async fn close(&self) -> Result<(), Self::Error>;
}
