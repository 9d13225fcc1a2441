use std::collections::VecDeque;

use bytes::Bytes;
use proven_pubsub::SubscriberMetadata;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sequencer::Sequencer;
use crate::tracker::{AckTracker, DeliveryCopy};

/// Lifecycle of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting publishes and subscriptions.
    Open,

    /// Waiting for in-flight deliveries after an unsubscribe or close.
    Draining,

    /// Terminal.
    Closed,
}

/// Copies queued for the delivery worker.
#[derive(Debug)]
pub struct WorkItem {
    pub generation: u64,
    pub copies: Vec<DeliveryCopy>,
}

#[derive(Debug)]
pub struct ActiveSubscription {
    pub generation: u64,
    pub metadata: SubscriberMetadata,
    pub tracker: AckTracker,
    pub work: mpsc::Sender<WorkItem>,

    /// Redeliveries that did not fit in the worker queue. Sent before any new
    /// batch.
    pub overflow: VecDeque<WorkItem>,

    pub cancel: CancellationToken,
}

impl ActiveSubscription {
    /// Queues `item` for the worker behind anything already waiting.
    pub fn enqueue(&mut self, item: WorkItem) {
        self.overflow.push_back(item);
        self.flush();
    }

    /// Moves waiting work into the worker queue while it has room. Returns
    /// whether the worker can take another batch.
    pub fn flush(&mut self) -> bool {
        while let Some(item) = self.overflow.pop_front() {
            match self.work.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    self.overflow.push_front(item);
                    return false;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        "Delivery worker gone, dropping {} queued batches",
                        self.overflow.len() + 1
                    );
                    self.overflow.clear();
                    return false;
                }
            }
        }

        !self.work.is_closed() && self.work.capacity() > 0
    }
}

/// Everything guarded by the partition lock.
#[derive(Debug)]
pub struct PartitionState {
    pub lifecycle: Lifecycle,

    /// Set once `close` starts, so a concurrent unsubscribe leaves the
    /// final transition to close.
    pub closing: bool,

    pub sequencer: Sequencer,
    pub ordering_key: Option<Bytes>,
    pub subscription: Option<ActiveSubscription>,

    /// Bumped on every subscribe. Tasks of older subscriptions compare against
    /// it and stand down.
    pub generation: u64,
}

impl PartitionState {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Open,
            closing: false,
            sequencer: Sequencer::new(),
            ordering_key: None,
            subscription: None,
            generation: 0,
        }
    }

    /// Size limit for publishes: the subscriber's while subscribed, the
    /// partition default otherwise.
    pub fn max_message_size(&self, default: usize) -> usize {
        self.subscription
            .as_ref()
            .map_or(default, |subscription| {
                subscription.tracker.options().max_message_size
            })
    }

    pub const fn is_open(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Open)
    }

    /// Error for operations other than publish against a non-open partition.
    pub fn unavailable(&self) -> Option<crate::Error> {
        match self.lifecycle {
            Lifecycle::Open => None,
            Lifecycle::Draining if !self.closing => Some(crate::Error::PartitionDraining),
            Lifecycle::Draining | Lifecycle::Closed => Some(crate::Error::PartitionClosed),
        }
    }

    /// Number of deliveries in flight.
    pub fn in_flight(&self) -> usize {
        self.subscription
            .as_ref()
            .map_or(0, |subscription| subscription.tracker.len())
    }

    /// Messages counted against the backlog: waiting for dispatch or not yet
    /// resolved.
    pub fn backlog(&self) -> usize {
        self.sequencer.len() + self.in_flight()
    }
}
