use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::MessageId;

/// Why a message was given up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Every permitted attempt failed or timed out.
    RetriesExhausted,

    /// The partition closed before the message was acknowledged.
    SubscriptionClosed,

    /// The message exceeds the subscriber's maximum message size.
    MessageTooLarge,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted => f.write_str("retries exhausted"),
            Self::SubscriptionClosed => f.write_str("subscription closed"),
            Self::MessageTooLarge => f.write_str("message too large"),
        }
    }
}

/// Terminal status of a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// The subscriber acknowledged the message.
    Acknowledged,

    /// The message was already processed within the dedup window; this copy
    /// was suppressed.
    Deduplicated,

    /// The message will not be delivered again.
    Failed {
        /// Why delivery stopped.
        reason: FailureReason,
        /// Last error reported by the handler, if any.
        last_error: Option<String>,
    },
}

/// Terminal outcome of one message on one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Topic of the partition.
    pub topic: String,

    /// Partition the message was published to.
    pub partition_id: u64,

    /// The message.
    pub message_id: MessageId,

    /// Number of times the message was handed to a handler.
    pub attempts: u32,

    /// Final status.
    pub status: DeliveryStatus,
}

impl DeliveryOutcome {
    /// Whether the outcome is a terminal failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self.status, DeliveryStatus::Failed { .. })
    }

    /// Failure reason, if the outcome is a failure.
    #[must_use]
    pub const fn failure_reason(&self) -> Option<FailureReason> {
        match &self.status {
            DeliveryStatus::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
