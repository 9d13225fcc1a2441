use proven_pubsub::{
    PartitionError, PartitionerError, PubSubError, PublisherError, SubscriberError,
};
use thiserror::Error;

/// Broad category of an error, used by callers to decide whether to back off,
/// give up, or fix their input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was malformed. Never retried.
    Validation,

    /// A capacity limit was hit. The caller may back off and retry.
    Capacity,

    /// The target is closed, draining, or already in use.
    Lifecycle,

    /// The configuration is unusable.
    Config,
}

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The topic name is empty.
    #[error("invalid topic - must not be empty")]
    InvalidTopic,

    /// The payload exceeds the maximum message size.
    #[error("message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Limit in force.
        limit: usize,
    },

    /// The partition backlog is full.
    #[error("backlog full: {0} messages pending")]
    BacklogFull(usize),

    /// Creating another partition would exceed the configured maximum.
    #[error("partition limit exceeded: at most {0} partitions")]
    PartitionLimitExceeded(usize),

    /// The partition is closed.
    #[error("partition closed")]
    PartitionClosed,

    /// The partition is draining in-flight deliveries.
    #[error("partition draining")]
    PartitionDraining,

    /// The subscription closed before the operation completed.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// A handler is already registered.
    #[error("already subscribed")]
    AlreadySubscribed,

    /// No handler is registered.
    #[error("not subscribed")]
    NotSubscribed,

    /// The pub/sub system or partitioner is closed.
    #[error("closed")]
    Closed,

    /// The configuration is invalid.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Category of the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTopic | Self::MessageTooLarge { .. } => ErrorKind::Validation,
            Self::BacklogFull(_) | Self::PartitionLimitExceeded(_) => ErrorKind::Capacity,
            Self::PartitionClosed
            | Self::PartitionDraining
            | Self::SubscriptionClosed
            | Self::AlreadySubscribed
            | Self::NotSubscribed
            | Self::Closed => ErrorKind::Lifecycle,
            Self::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// Whether the caller may retry the same call after backing off.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Capacity) || matches!(self, Self::PartitionDraining)
    }
}

impl PartitionError for Error {}
impl PartitionerError for Error {}
impl PublisherError for Error {}
impl SubscriberError for Error {}
impl PubSubError for Error {}
