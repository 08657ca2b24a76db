//! Interfaces to the underlying pull-based broker client.
//!
//! The broker client itself lives outside this crate; the consume pipeline
//! only depends on these traits. The consumer side is deliberately
//! `&mut self`: it is not safe to share, and the poll loop owns it
//! exclusively, so every broker call is serialized on one task.

use crate::error::Result;
use crate::message::Message;
use crate::types::{OffsetAndMetadata, RecordMetadata, TopicPartition};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Pull-side primitives of the broker client
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Fetch the next records, blocking up to `timeout`
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Message>>;

    /// Stop fetching from the given partitions until they are resumed
    async fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Resume fetching from previously paused partitions
    async fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Partitions currently paused
    fn paused(&self) -> HashSet<TopicPartition>;

    /// Partitions currently assigned to this consumer
    fn assignment(&self) -> HashSet<TopicPartition>;

    /// Subscribe to the given topics. The handler is invoked from inside
    /// `poll` while the group rebalances; commits it returns on revoke are
    /// applied before the revoke completes, and seek targets it returns on
    /// assign are applied before fetching starts.
    async fn subscribe(
        &mut self,
        topics: &[String],
        handler: Arc<dyn RebalanceHandler>,
    ) -> Result<()>;

    /// Subscribe to every topic matching the pattern
    async fn subscribe_pattern(
        &mut self,
        pattern: &str,
        handler: Arc<dyn RebalanceHandler>,
    ) -> Result<()>;

    /// Drop all subscriptions and assignments
    async fn unsubscribe(&mut self) -> Result<()>;

    /// Move the fetch position of one partition
    async fn seek(&mut self, partition: &TopicPartition, offset: u64) -> Result<()>;

    /// Move the fetch position to the earliest available offset
    async fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Move the fetch position past the latest record
    async fn seek_to_end(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Earliest offsets at or after the given timestamps
    async fn offsets_for_times(
        &mut self,
        timestamps: HashMap<TopicPartition, u64>,
    ) -> Result<HashMap<TopicPartition, u64>>;

    /// Commit the given offsets and wait for the broker to confirm
    async fn commit_sync(
        &mut self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<()>;
}

/// Publish-side primitive used to republish retries and dead letters.
/// Unlike the consumer, the producer is shared freely across tasks.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Publish a record and wait for its placement
    async fn send(&self, message: Message) -> Result<RecordMetadata>;
}

/// Callbacks around consumer group rebalances.
///
/// Implemented by the offset persistor; kept as its own trait so progress
/// persistence and rebalance handling stay separable.
#[async_trait]
pub trait RebalanceHandler: Send + Sync {
    /// Partitions are being taken away. Returns final commits for them,
    /// which the broker applies before completing the revoke.
    async fn on_partitions_revoked(
        &self,
        partitions: &[TopicPartition],
    ) -> HashMap<TopicPartition, OffsetAndMetadata>;

    /// Partitions were newly assigned. Returns fetch positions to seek to
    /// before consumption starts; partitions absent from the map start at
    /// the broker-side committed offset.
    async fn on_partitions_assigned(
        &self,
        partitions: &[TopicPartition],
    ) -> HashMap<TopicPartition, u64>;
}

/// No-op rebalance handler
pub struct NoopRebalanceHandler;

#[async_trait]
impl RebalanceHandler for NoopRebalanceHandler {
    async fn on_partitions_revoked(
        &self,
        _partitions: &[TopicPartition],
    ) -> HashMap<TopicPartition, OffsetAndMetadata> {
        HashMap::new()
    }

    async fn on_partitions_assigned(
        &self,
        _partitions: &[TopicPartition],
    ) -> HashMap<TopicPartition, u64> {
        HashMap::new()
    }
}
