use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic and partition identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    /// Create a new TopicPartition
    pub fn new<T: Into<String>>(topic: T, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Offset and metadata for a topic partition commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetAndMetadata {
    pub offset: u64,
    pub metadata: Option<String>,
    pub commit_timestamp: u64,
}

impl OffsetAndMetadata {
    /// Create a new OffsetAndMetadata stamped with the current wall clock
    pub fn new(offset: u64, metadata: Option<String>) -> Self {
        let commit_timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            offset,
            metadata,
            commit_timestamp,
        }
    }
}

/// Broker-assigned placement of a published record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub timestamp: u64,
}
