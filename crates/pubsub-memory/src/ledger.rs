//! Dedup ledger backing exactly-once subscriptions.
//!
//! Remembers message ids that were acknowledged successfully. Entries expire
//! after the retention window, so exactly-once only holds within that window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proven_pubsub::MessageId;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DedupLedgerConfig;

#[derive(Debug)]
struct LedgerState {
    /// Acknowledgement time of each id, in milliseconds since the Unix epoch.
    entries: HashMap<MessageId, i64>,
    /// Insertion order, oldest first. Expiry is measured from these instants.
    order: VecDeque<(Instant, MessageId)>,
    retention: Duration,
}

impl LedgerState {
    fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((marked_at, _)) = self.order.front() {
            if now.saturating_duration_since(*marked_at) < self.retention {
                break;
            }
            if let Some((_, id)) = self.order.pop_front() {
                self.entries.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    fn evict_oldest(&mut self) {
        if let Some((_, id)) = self.order.pop_front() {
            self.entries.remove(&id);
        }
    }
}

/// Shared record of successfully processed message ids.
#[derive(Clone, Debug)]
pub struct DedupLedger {
    state: Arc<Mutex<LedgerState>>,
    config: DedupLedgerConfig,
}

impl DedupLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new(config: DedupLedgerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                retention: config.retention,
            })),
            config,
        }
    }

    /// Widens the retention window so it covers `redelivery_span` plus slack.
    ///
    /// The window never shrinks.
    pub fn ensure_retention(&self, redelivery_span: Duration) {
        let required = redelivery_span.saturating_add(self.config.slack);
        let mut state = self.state.lock();
        if required > state.retention {
            debug!(
                "Widening dedup retention from {:?} to {:?}",
                state.retention, required
            );
            state.retention = required;
        }
    }

    /// Current retention window.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.state.lock().retention
    }

    /// Records a successful acknowledgement.
    ///
    /// Returns `true` if this is the first success for `message_id` within the
    /// retention window, `false` if it was already recorded.
    pub fn mark_success(&self, message_id: &MessageId, acknowledged_at_ms: i64) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.evict_expired(now);

        if state.entries.contains_key(message_id) {
            return false;
        }

        while state.entries.len() >= self.config.max_entries {
            state.evict_oldest();
        }

        state.entries.insert(message_id.clone(), acknowledged_at_ms);
        state.order.push_back((now, message_id.clone()));
        true
    }

    /// Whether a success is recorded for `message_id`.
    #[must_use]
    pub fn contains(&self, message_id: &MessageId) -> bool {
        let mut state = self.state.lock();
        state.evict_expired(Instant::now());
        state.entries.contains_key(message_id)
    }

    /// Time of the recorded success, in milliseconds since the Unix epoch.
    #[must_use]
    pub fn acknowledged_at(&self, message_id: &MessageId) -> Option<i64> {
        let mut state = self.state.lock();
        state.evict_expired(Instant::now());
        state.entries.get(message_id).copied()
    }

    /// Drops expired entries, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.state.lock().evict_expired(Instant::now())
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no ids are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
