//! Per-partition in-flight buffer and acknowledgment tracking.
//!
//! The poll loop stores records here, the dispatcher drains them in
//! batches, and completed tasks acknowledge offsets back. Each partition
//! tracks a commit watermark: the highest offset below which every stored
//! offset has been acknowledged. The broker is given `watermark + 1`.

use crate::message::Message;
use crate::types::TopicPartition;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet, VecDeque};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Shared buffer over all assigned partitions.
///
/// Entries are created lazily on the first stored record and dropped on
/// `reset` (seek or partition revocation).
pub struct PartitionBuffer {
    capacity: usize,
    states: DashMap<TopicPartition, PartitionState>,
    ready: Notify,
}

struct PartitionState {
    /// Stored records not yet claimed by the dispatcher, in broker order
    pending: VecDeque<Message>,
    /// Offsets of the chunk currently handed to a task, until acked
    claimed: BTreeSet<u64>,
    /// Every stored offset not yet acknowledged (pending plus claimed)
    unacked: BTreeSet<u64>,
    /// Acknowledged offsets waiting to be absorbed into the watermark
    acked: BTreeSet<u64>,
    watermark: Option<u64>,
    advanced: bool,
}

impl PartitionState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            claimed: BTreeSet::new(),
            unacked: BTreeSet::new(),
            acked: BTreeSet::new(),
            watermark: None,
            advanced: false,
        }
    }

    fn in_memory(&self) -> usize {
        self.unacked.len()
    }

    fn absorb_acks(&mut self) {
        while let Some(&lowest) = self.acked.first() {
            let blocked = self
                .unacked
                .first()
                .map(|&unacked| unacked < lowest)
                .unwrap_or(false);
            if blocked {
                break;
            }
            self.acked.pop_first();
            self.watermark = Some(lowest);
            self.advanced = true;
        }
    }
}

impl PartitionBuffer {
    /// Create a buffer with the given per-partition capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            states: DashMap::new(),
            ready: Notify::new(),
        }
    }

    /// Store polled records, preserving broker order within each partition.
    ///
    /// Returns the partitions that are now at or over capacity and must be
    /// paused at the broker.
    pub fn store(&self, messages: Vec<Message>) -> HashSet<TopicPartition> {
        let mut full = HashSet::new();
        for message in messages {
            let tp = TopicPartition::new(message.topic.clone(), message.partition);
            let mut state = self
                .states
                .entry(tp.clone())
                .or_insert_with(PartitionState::new);

            let offset = message.offset;
            let already_absorbed = state.watermark.map(|w| offset <= w).unwrap_or(false);
            if already_absorbed || state.unacked.contains(&offset) || state.acked.contains(&offset)
            {
                debug!("dropping re-delivered record {} at offset {}", tp, offset);
            } else {
                state.unacked.insert(offset);
                state.pending.push_back(message);
            }

            if state.in_memory() >= self.capacity {
                full.insert(tp);
            }
        }
        if !full.is_empty() {
            debug!("partitions at capacity: {:?}", full);
        }
        self.ready.notify_waiters();
        full
    }

    /// Claim the next contiguous chunk for one partition.
    ///
    /// Returns `None` while a previous chunk is still unacknowledged; only
    /// one chunk per partition is ever in flight, which is what keeps
    /// per-partition delivery ordered.
    pub fn drain_ready(
        &self,
        partition: &TopicPartition,
        batch_size: usize,
    ) -> Option<Vec<Message>> {
        let mut state = self.states.get_mut(partition)?;
        if !state.claimed.is_empty() || state.pending.is_empty() {
            return None;
        }

        let take = batch_size.min(state.pending.len());
        let batch: Vec<Message> = state.pending.drain(..take).collect();
        state.claimed = batch.iter().map(|m| m.offset).collect();
        Some(batch)
    }

    /// Return a claimed chunk to the head of its partition unconsumed.
    /// Used by the ordered consume mode to re-deliver after a suspend.
    pub fn requeue_front(&self, partition: &TopicPartition, messages: Vec<Message>) {
        let Some(mut state) = self.states.get_mut(partition) else {
            // Partition was reset while the task ran; nothing to requeue.
            return;
        };
        for message in messages.into_iter().rev() {
            state.claimed.remove(&message.offset);
            state.pending.push_front(message);
        }
        drop(state);
        self.ready.notify_waiters();
    }

    /// Mark offsets acknowledged and advance the watermark.
    ///
    /// Acks may arrive in any order; the watermark only moves over a
    /// contiguous run of acknowledged offsets. Acks against a reset
    /// partition or unknown offsets are dropped with a warning.
    pub fn ack(&self, partition: &TopicPartition, offsets: &[u64]) {
        let Some(mut state) = self.states.get_mut(partition) else {
            warn!("ack for unassigned partition {}, ignoring", partition);
            return;
        };

        for &offset in offsets {
            if state.unacked.remove(&offset) {
                state.claimed.remove(&offset);
                state.acked.insert(offset);
            } else {
                warn!("ack for unknown offset {} on {}, ignoring", offset, partition);
            }
        }
        state.absorb_acks();
        drop(state);
        self.ready.notify_waiters();
    }

    /// Offset to commit for one partition, when progress was made since the
    /// previous call. The returned value is the next offset to consume.
    pub fn take_commit(&self, partition: &TopicPartition) -> Option<u64> {
        let mut state = self.states.get_mut(partition)?;
        if !state.advanced {
            return None;
        }
        state.advanced = false;
        state.watermark.map(|w| w + 1)
    }

    /// Discard all buffered state for one partition
    pub fn reset(&self, partition: &TopicPartition) {
        if self.states.remove(partition).is_some() {
            debug!("partition buffer {} reset", partition);
        }
    }

    /// Discard all buffered state
    pub fn reset_all(&self) {
        self.states.clear();
    }

    /// Partitions currently holding state, in deterministic order
    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> =
            self.states.iter().map(|e| e.key().clone()).collect();
        partitions.sort();
        partitions
    }

    /// Stored and not yet acknowledged message count for one partition
    pub fn pending_count(&self, partition: &TopicPartition) -> usize {
        self.states
            .get(partition)
            .map(|s| s.in_memory())
            .unwrap_or(0)
    }

    /// Whether a paused partition has drained enough to resume fetching
    pub fn below_resume_threshold(&self, partition: &TopicPartition) -> bool {
        self.pending_count(partition) < (self.capacity / 2).max(1)
    }

    /// Wakeup handle for the dispatcher
    pub(crate) fn ready(&self) -> &Notify {
        &self.ready
    }
}
