//! Per-ordering-key sequencing of pending messages.
//!
//! Each ordering key gets its own lane. Lanes are drained oldest head first,
//! and a coupled lane only yields its next batch once every message of its
//! previous batches has been released.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use proven_pubsub::Message;

/// Lane a message is sequenced in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SequenceKey {
    /// Messages published without an ordering key.
    Unordered,

    /// Messages sharing a non-empty ordering key.
    Keyed(Bytes),
}

impl SequenceKey {
    /// Lane for an optional ordering key. Empty keys are unordered.
    #[must_use]
    pub fn from_ordering_key(ordering_key: Option<Bytes>) -> Self {
        match ordering_key {
            Some(key) if !key.is_empty() => Self::Keyed(key),
            _ => Self::Unordered,
        }
    }

    /// Whether completion of a batch in this lane may hold back the next one.
    #[must_use]
    pub const fn is_keyed(&self) -> bool {
        matches!(self, Self::Keyed(_))
    }
}

/// A message waiting in a lane.
#[derive(Clone, Debug)]
pub struct Sequenced {
    /// The message.
    pub message: Message,

    /// Partition-wide publish sequence number.
    pub seq: u64,

    /// Failed attempts so far. Non-zero only for requeued messages.
    pub retries: u32,

    /// Times the message was handed to a handler so far.
    pub deliveries: u32,
}

/// Messages taken from one lane in publish order.
#[derive(Debug)]
pub struct Batch {
    /// Lane the batch was taken from.
    pub key: SequenceKey,

    /// The messages, oldest first.
    pub items: Vec<Sequenced>,
}

#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<Sequenced>,
    outstanding: usize,
}

impl Lane {
    fn head_seq(&self) -> Option<u64> {
        self.pending.front().map(|item| item.seq)
    }
}

/// Orders pending messages into per-key batches.
#[derive(Debug, Default)]
pub struct Sequencer {
    lanes: HashMap<SequenceKey, Lane>,
    len: usize,
    next_seq: u64,
}

impl Sequencer {
    /// Creates an empty sequencer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to the lane for `ordering_key`, returning its
    /// sequence number.
    pub fn push(&mut self, message: Message, ordering_key: Option<Bytes>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let key = SequenceKey::from_ordering_key(ordering_key);
        self.lanes.entry(key).or_default().pending.push_back(Sequenced {
            message,
            seq,
            retries: 0,
            deliveries: 0,
        });
        self.len += 1;

        seq
    }

    /// Takes the next batch, if any lane may dispatch.
    ///
    /// When `coupled` is set, keyed lanes with outstanding messages are
    /// skipped and every message taken from a keyed lane counts as
    /// outstanding until [`release`](Self::release) is called for it.
    pub fn next_batch(&mut self, coupled: bool, max_batch_size: usize) -> Option<Batch> {
        let key = self
            .lanes
            .iter()
            .filter(|(key, lane)| !(coupled && key.is_keyed() && lane.outstanding > 0))
            .filter_map(|(key, lane)| lane.head_seq().map(|seq| (seq, key)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, key)| key.clone())?;

        let lane = self.lanes.get_mut(&key)?;
        let take = lane.pending.len().min(max_batch_size.max(1));
        let items: Vec<Sequenced> = lane.pending.drain(..take).collect();

        if coupled && key.is_keyed() {
            lane.outstanding += items.len();
        }
        self.len -= items.len();
        self.prune(&key);

        Some(Batch { key, items })
    }

    /// Marks one outstanding message of `key` as resolved.
    pub fn release(&mut self, key: &SequenceKey) {
        if let Some(lane) = self.lanes.get_mut(key) {
            lane.outstanding = lane.outstanding.saturating_sub(1);
        }
        self.prune(key);
    }

    /// Puts an undelivered message back into its lane ahead of anything
    /// published after it.
    pub fn requeue(&mut self, key: SequenceKey, item: Sequenced) {
        let lane = self.lanes.entry(key).or_default();
        let position = lane.pending.partition_point(|pending| pending.seq < item.seq);
        lane.pending.insert(position, item);
        self.len += 1;
    }

    /// Removes pending messages larger than `limit` bytes.
    pub fn remove_oversize(&mut self, limit: usize) -> Vec<Sequenced> {
        let mut removed = Vec::new();
        for lane in self.lanes.values_mut() {
            let (keep, oversize): (VecDeque<_>, VecDeque<_>) = lane
                .pending
                .drain(..)
                .partition(|item| item.message.len() <= limit);
            lane.pending = keep;
            removed.extend(oversize);
        }

        self.len -= removed.len();
        self.lanes
            .retain(|_, lane| !lane.pending.is_empty() || lane.outstanding > 0);
        removed.sort_by_key(|item| item.seq);
        removed
    }

    /// Empties every lane, returning pending messages in publish order.
    pub fn drain_all(&mut self) -> Vec<Sequenced> {
        let mut items: Vec<Sequenced> = self
            .lanes
            .drain()
            .flat_map(|(_, lane)| lane.pending)
            .collect();
        items.sort_by_key(|item| item.seq);
        self.len = 0;
        items
    }

    /// Number of pending messages.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    fn prune(&mut self, key: &SequenceKey) {
        if self
            .lanes
            .get(key)
            .is_some_and(|lane| lane.pending.is_empty() && lane.outstanding == 0)
        {
            self.lanes.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(sequencer: &mut Sequencer, body: &'static str, key: Option<&'static str>) {
        sequencer.push(
            Message::from(body).with_message_id(body),
            key.map(|key| Bytes::from_static(key.as_bytes())),
        );
    }

    fn bodies(batch: &Batch) -> Vec<&str> {
        batch
            .items
            .iter()
            .map(|item| item.message.message_id.as_str())
            .collect()
    }

    #[test]
    fn test_empty_key_is_unordered() {
        assert_eq!(
            SequenceKey::from_ordering_key(Some(Bytes::new())),
            SequenceKey::Unordered
        );
        assert_eq!(SequenceKey::from_ordering_key(None), SequenceKey::Unordered);
    }

    #[test]
    fn test_lanes_emitted_by_head_sequence() {
        let mut sequencer = Sequencer::new();
        push(&mut sequencer, "a1", Some("a"));
        push(&mut sequencer, "u1", None);
        push(&mut sequencer, "a2", Some("a"));
        push(&mut sequencer, "b1", Some("b"));

        let first = sequencer.next_batch(false, 10).unwrap();
        assert_eq!(bodies(&first), vec!["a1", "a2"]);

        let second = sequencer.next_batch(false, 10).unwrap();
        assert_eq!(bodies(&second), vec!["u1"]);

        let third = sequencer.next_batch(false, 10).unwrap();
        assert_eq!(bodies(&third), vec!["b1"]);

        assert!(sequencer.next_batch(false, 10).is_none());
        assert_eq!(sequencer.len(), 0);
    }

    #[test]
    fn test_coupled_lane_waits_for_release() {
        let mut sequencer = Sequencer::new();
        push(&mut sequencer, "a1", Some("a"));
        push(&mut sequencer, "a2", Some("a"));

        let first = sequencer.next_batch(true, 1).unwrap();
        assert_eq!(bodies(&first), vec!["a1"]);
        assert!(sequencer.next_batch(true, 1).is_none());

        sequencer.release(&first.key);
        let second = sequencer.next_batch(true, 1).unwrap();
        assert_eq!(bodies(&second), vec!["a2"]);
    }

    #[test]
    fn test_unordered_lane_never_held() {
        let mut sequencer = Sequencer::new();
        push(&mut sequencer, "u1", None);
        push(&mut sequencer, "u2", None);

        assert_eq!(bodies(&sequencer.next_batch(true, 1).unwrap()), vec!["u1"]);
        assert_eq!(bodies(&sequencer.next_batch(true, 1).unwrap()), vec!["u2"]);
    }

    #[test]
    fn test_requeue_restores_publish_order() {
        let mut sequencer = Sequencer::new();
        push(&mut sequencer, "a1", Some("a"));
        push(&mut sequencer, "a2", Some("a"));
        push(&mut sequencer, "a3", Some("a"));

        let mut batch = sequencer.next_batch(true, 2).unwrap();
        let a2 = batch.items.pop().unwrap();
        let a1 = batch.items.pop().unwrap();

        sequencer.release(&batch.key);
        sequencer.release(&batch.key);
        sequencer.requeue(batch.key.clone(), a2);
        sequencer.requeue(batch.key, a1);

        assert_eq!(sequencer.len(), 3);
        let all = sequencer.next_batch(true, 10).unwrap();
        assert_eq!(bodies(&all), vec!["a1", "a2", "a3"]);
    }

    #[test]
    fn test_remove_oversize() {
        let mut sequencer = Sequencer::new();
        sequencer.push(Message::new(vec![0u8; 8]).with_message_id("big"), None);
        push(&mut sequencer, "ok", None);

        let removed = sequencer.remove_oversize(4);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].message.message_id.as_str(), "big");
        assert_eq!(sequencer.len(), 1);
    }

    #[test]
    fn test_drain_all_in_publish_order() {
        let mut sequencer = Sequencer::new();
        push(&mut sequencer, "b1", Some("b"));
        push(&mut sequencer, "a1", Some("a"));
        push(&mut sequencer, "u1", None);

        let drained: Vec<_> = sequencer
            .drain_all()
            .into_iter()
            .map(|item| item.message.message_id.to_string())
            .collect();

        assert_eq!(drained, vec!["b1", "a1", "u1"]);
        assert_eq!(sequencer.len(), 0);
    }
}
