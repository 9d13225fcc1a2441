use crate::partition::Partition;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for partitioner errors
pub trait PartitionerError: Error + Send + Sync + 'static {}

/// Maps topics and keys to partitions.
#[async_trait]
pub trait Partitioner
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the partitioner.
    type Error: PartitionerError;

    /// The partition type handed out.
    type Partition: Partition;

    /// Returns the partition for `key` on `topic`, creating it if needed.
    async fn partition(&self, topic: &str, key: &[u8]) -> Result<Self::Partition, Self::Error>;

    /// Closes every partition created by this partitioner.
    async fn close(&self) -> Result<(), Self::Error>;
}
