//! In-memory (single node) implementation of partitioned pub/sub.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod ledger;
mod partition;
mod partitioner;
mod pubsub;
mod routing;
mod sequencer;
mod tracker;

pub use config::{BacklogPolicy, DedupLedgerConfig, MemoryPubSubConfig, PartitionConfig};
pub use error::{Error, ErrorKind};
pub use ledger::DedupLedger;
pub use partition::MemoryPartition;
pub use partitioner::MemoryPartitioner;
pub use pubsub::MemoryPubSub;
