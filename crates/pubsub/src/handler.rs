use crate::message::Message;

use async_trait::async_trait;

/// Receives batches of messages from a partition.
///
/// Messages sharing an ordering key arrive in publish order. The handler
/// reports the result of each message on the ack channel supplied at
/// subscribe time; returning from `deliver` does not acknowledge anything.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Handles one batch.
    async fn deliver(&self, batch: Vec<Message>);
}

#[async_trait]
impl<F> BatchHandler for F
where
    F: Fn(Vec<Message>) + Send + Sync + 'static,
{
    async fn deliver(&self, batch: Vec<Message>) {
        self(batch);
    }
}
