use crate::error::Result;
use crate::message::Message;
use crate::topics;
use crate::types::TopicPartition;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Outcome of one handler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStatus {
    /// The whole batch was consumed; acknowledge every offset
    Success,

    /// Re-deliver the batch later, except for indexes the handler marked
    /// successful on the context
    RetryLater,
}

/// Handler for the concurrent consume mode. Batches from different
/// partitions run in parallel on the worker pool.
///
/// Returning `Err` is equivalent to `RetryLater` for the whole batch.
#[async_trait]
pub trait ConcurrentHandler: Send + Sync {
    async fn consume_message(
        &self,
        messages: Vec<Message>,
        ctx: &ConcurrentContext,
    ) -> Result<ConsumeStatus>;
}

/// Handler for the ordered consume mode. Within a partition the next batch
/// is only dispatched after the previous one acknowledged.
#[async_trait]
pub trait OrdinalHandler: Send + Sync {
    async fn consume_message(
        &self,
        messages: Vec<Message>,
        ctx: &OrdinalContext,
    ) -> Result<ConsumeStatus>;
}

const DELAY_LEVEL_UNSET: i64 = i64::MIN;

/// Per-invocation context handed to a [`ConcurrentHandler`].
///
/// The handler writes into it while running; post-processing reads it after
/// the handler returned. It is scoped to a single batch on a single task.
pub struct ConcurrentContext {
    partition: TopicPartition,
    first_offset: u64,
    acked: Vec<AtomicBool>,
    delay_level_override: AtomicI64,
}

impl ConcurrentContext {
    pub(crate) fn new(partition: TopicPartition, first_offset: u64, batch_len: usize) -> Self {
        Self {
            partition,
            first_offset,
            acked: (0..batch_len).map(|_| AtomicBool::new(false)).collect(),
            delay_level_override: AtomicI64::new(DELAY_LEVEL_UNSET),
        }
    }

    /// Partition the batch was drained from
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Offset of the first message in the batch
    pub fn first_offset(&self) -> u64 {
        self.first_offset
    }

    /// Number of messages in the batch
    pub fn batch_size(&self) -> usize {
        self.acked.len()
    }

    /// Mark one index of the batch as successfully consumed. On a
    /// `RetryLater` return, marked messages are acknowledged instead of
    /// re-delivered.
    pub fn mark_success(&self, index: usize) {
        if let Some(flag) = self.acked.get(index) {
            flag.store(true, Ordering::Release);
        }
    }

    pub(crate) fn is_marked_success(&self, index: usize) -> bool {
        self.acked
            .get(index)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Override the delay level used when re-delivering this batch. Levels
    /// off the ladder are ignored.
    pub fn set_delay_level(&self, level: u32) {
        self.delay_level_override
            .store(level as i64, Ordering::Release);
    }

    pub(crate) fn delay_level_override(&self) -> Option<u32> {
        let raw = self.delay_level_override.load(Ordering::Acquire);
        if raw == DELAY_LEVEL_UNSET {
            return None;
        }
        let level = raw as u32;
        topics::is_valid_delay_level(level).then_some(level)
    }
}

/// Per-invocation context handed to an [`OrdinalHandler`]
pub struct OrdinalContext {
    partition: TopicPartition,
    first_offset: u64,
    suspend_ms: AtomicU64,
}

impl OrdinalContext {
    pub(crate) fn new(partition: TopicPartition, first_offset: u64) -> Self {
        Self {
            partition,
            first_offset,
            suspend_ms: AtomicU64::new(1000),
        }
    }

    /// Partition the batch was drained from
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Offset of the first message in the batch
    pub fn first_offset(&self) -> u64 {
        self.first_offset
    }

    /// How long to keep the partition quiet before the batch re-enters the
    /// head of its buffer. Defaults to one second.
    pub fn suspend_time_ms(&self, millis: u64) {
        self.suspend_ms.store(millis, Ordering::Release);
    }

    pub(crate) fn suspend_ms(&self) -> u64 {
        self.suspend_ms.load(Ordering::Acquire)
    }
}

/// Filter applied to every polled record before it is buffered
pub trait MessageFilter: Send + Sync {
    /// When true the filter is skipped entirely
    fn is_permit_all(&self) -> bool {
        false
    }

    /// Decide whether a record is delivered to the consume pipeline
    fn can_deliver(&self, payload: &Bytes, headers: &HashMap<String, String>) -> bool;
}

/// Default filter that delivers everything
pub struct PermitAllFilter;

impl MessageFilter for PermitAllFilter {
    fn is_permit_all(&self) -> bool {
        true
    }

    fn can_deliver(&self, _payload: &Bytes, _headers: &HashMap<String, String>) -> bool {
        true
    }
}
