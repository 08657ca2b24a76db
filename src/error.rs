use thiserror::Error;

/// Result type alias for push consumer operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur in the push consumer client
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Broker error surfaced by the underlying consumer or producer
    #[error("Broker error: {0}")]
    Broker(String),

    /// Consumer errors
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Producer errors
    #[error("Producer error: {0}")]
    Producer(String),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Partition not found or no longer assigned
    #[error("Partition not found: topic={topic}, partition={partition}")]
    PartitionNotFound { topic: String, partition: u32 },

    /// Consumer group rebalancing in progress
    #[error("Consumer group rebalancing in progress")]
    RebalancingInProgress,

    /// Offset persistence error (broadcast mode file storage)
    #[error("Offset store error: {0}")]
    OffsetStore(String),

    /// The worker pool rejected a task because its queue is full
    #[error("Consume task queue is full")]
    TaskQueueFull,

    /// Start-time wiring or subscription failure
    #[error("Startup failed: {0}")]
    Startup(String),

    /// Invalid operation for the current lifecycle state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Internal client error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::OffsetStore(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ClientError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        ClientError::Timeout { timeout_ms: 0 }
    }
}

impl ClientError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Broker(_)
                | ClientError::Timeout { .. }
                | ClientError::RebalancingInProgress
                | ClientError::TaskQueueFull
        )
    }
}
