use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hard cap on the number of messages handed to one handler invocation.
pub const MAX_CONSUME_BATCH_SIZE: usize = 32;

/// How consumption progress is shared across members of a group
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsumeModel {
    /// Partitions are distributed across the group; progress is committed
    /// to the broker.
    Clustering,

    /// Every consumer reads all partitions; progress is persisted to local
    /// files.
    Broadcasting,
}

/// Consumer configuration
///
/// Immutable once the consumer is started; the runtime holds it behind an
/// `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Broker endpoints
    pub bootstrap_servers: Vec<String>,

    /// Consumer group id
    pub group_id: String,

    /// Client id; generated when left unset
    pub client_id: Option<String>,

    /// Consume model
    pub consume_model: ConsumeModel,

    /// Messages per handler invocation, clamped to `1..=MAX_CONSUME_BATCH_SIZE`
    pub consume_batch_size: usize,

    /// Number of concurrent handler workers
    pub consume_thread_num: usize,

    /// Capacity of the pending task queue feeding the workers
    pub consume_queue_size: usize,

    /// Per-partition in-flight message capacity before the partition is
    /// paused at the broker
    pub partition_buffer_capacity: usize,

    /// Timeout handed to each broker poll call
    pub poll_await_timeout: Duration,

    /// Budget for one handler invocation; the handler future is cancelled
    /// when it elapses and the batch falls through to the retry path
    pub max_message_deal_time: Duration,

    /// Backoff before re-submitting a task the worker pool rejected
    pub client_task_retry_backoff: Duration,

    /// Interval between commit flushes
    pub commit_interval: Duration,

    /// Directory for per-partition offset files (Broadcasting mode only)
    pub offset_store_dir: PathBuf,

    /// When true, a failed dead-letter publish keeps the message on the
    /// local retry path instead of acknowledging it
    pub dlq_publish_failure_blocks: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            group_id: "default-group".to_string(),
            client_id: None,
            consume_model: ConsumeModel::Clustering,
            consume_batch_size: 10,
            consume_thread_num: 4,
            consume_queue_size: 500,
            partition_buffer_capacity: 1000,
            poll_await_timeout: Duration::from_millis(1000),
            max_message_deal_time: Duration::from_secs(30),
            client_task_retry_backoff: Duration::from_secs(3),
            commit_interval: Duration::from_secs(1),
            offset_store_dir: PathBuf::from(".pushmq-offsets"),
            dlq_publish_failure_blocks: false,
        }
    }
}

impl ConsumerConfig {
    /// Validate the configuration and clamp the batch size to its cap
    pub fn validate(mut self) -> Result<Self> {
        if self.group_id.is_empty() {
            return Err(ClientError::InvalidConfig(
                "Consumer group id is required".to_string(),
            ));
        }
        if self.consume_thread_num == 0 {
            return Err(ClientError::InvalidConfig(
                "consume_thread_num must be at least 1".to_string(),
            ));
        }
        if self.consume_queue_size == 0 {
            return Err(ClientError::InvalidConfig(
                "consume_queue_size must be at least 1".to_string(),
            ));
        }
        if self.partition_buffer_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "partition_buffer_capacity must be at least 1".to_string(),
            ));
        }
        self.consume_batch_size = self.consume_batch_size.clamp(1, MAX_CONSUME_BATCH_SIZE);
        Ok(self)
    }
}
