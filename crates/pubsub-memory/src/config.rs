use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// What a publish does when the partition backlog is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BacklogPolicy {
    /// Fail immediately with `BacklogFull`.
    #[default]
    FailFast,

    /// Wait until space frees up or the partition closes.
    Block,
}

/// Configuration shared by every partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Maximum number of undispatched messages held by a partition.
    pub backlog_size: usize,

    /// Behaviour of publishes against a full backlog.
    pub backlog_policy: BacklogPolicy,

    /// Maximum payload size accepted while no subscriber is registered.
    pub max_message_size: usize,

    /// Maximum number of messages handed to a handler in one call.
    pub max_batch_size: usize,

    /// Interval of the ack-timeout sweep.
    pub ack_sweep_interval: Duration,

    /// How long unsubscribe and close wait for in-flight deliveries.
    pub drain_grace: Duration,

    /// Capacity of the delivery outcome broadcast channel.
    pub outcome_buffer: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            backlog_size: 10_000,
            backlog_policy: BacklogPolicy::FailFast,
            max_message_size: 1024 * 1024, // 1MB
            max_batch_size: 256,
            ack_sweep_interval: Duration::from_millis(10),
            drain_grace: Duration::from_secs(5),
            outcome_buffer: 1024,
        }
    }
}

/// Configuration of the dedup ledger used by exactly-once subscriptions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupLedgerConfig {
    /// Minimum time a successful message id is remembered.
    pub retention: Duration,

    /// Added to the longest redelivery span of any subscription when that
    /// span exceeds `retention`.
    pub slack: Duration,

    /// Upper bound on remembered ids; the oldest are evicted first.
    pub max_entries: usize,
}

impl Default for DedupLedgerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
            slack: Duration::from_secs(1),
            max_entries: 100_000,
        }
    }
}

/// Configuration for the in-memory pub/sub system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPubSubConfig {
    /// Number of hash buckets keys are spread over within a topic.
    pub partitions_per_topic: u32,

    /// Maximum number of partitions across all topics.
    pub max_partitions: usize,

    /// Per-partition settings.
    pub partition: PartitionConfig,

    /// Dedup ledger settings.
    pub dedup: DedupLedgerConfig,
}

impl Default for MemoryPubSubConfig {
    fn default() -> Self {
        Self {
            partitions_per_topic: 64,
            max_partitions: 4096,
            partition: PartitionConfig::default(),
            dedup: DedupLedgerConfig::default(),
        }
    }
}

impl MemoryPubSubConfig {
    /// Checks that every size and interval is usable.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        let checks = [
            (self.partitions_per_topic == 0, "partitions_per_topic"),
            (self.max_partitions == 0, "max_partitions"),
            (self.partition.backlog_size == 0, "partition.backlog_size"),
            (self.partition.max_batch_size == 0, "partition.max_batch_size"),
            (
                self.partition.ack_sweep_interval.is_zero(),
                "partition.ack_sweep_interval",
            ),
            (self.partition.outcome_buffer == 0, "partition.outcome_buffer"),
            (self.dedup.max_entries == 0, "dedup.max_entries"),
        ];

        for (invalid, field) in checks {
            if invalid {
                return Err(Error::InvalidConfig(format!("{field} must be non-zero")));
            }
        }

        Ok(())
    }
}
