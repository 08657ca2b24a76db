//! PushMQ Client Library
//!
//! Push-style consumer client over a pull-based log broker. Applications
//! register a batch handler; the client fetches, buffers with per-partition
//! backpressure, dispatches batches concurrently, retries failures over a
//! delay-topic ladder with a dead-letter terminus, and commits progress.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod topics;
pub mod types;

mod buffer;
mod dispatch;
mod offset;
mod poll_loop;
mod retry;
mod task;
mod worker;

pub use broker::{BrokerConsumer, BrokerProducer, RebalanceHandler};
pub use config::{ConsumeModel, ConsumerConfig};
pub use consumer::{ConsumerMetrics, PushConsumer, PushConsumerBuilder};
pub use error::{ClientError, Result};
pub use handler::{
    ConcurrentContext, ConcurrentHandler, ConsumeStatus, MessageFilter, OrdinalContext,
    OrdinalHandler, PermitAllFilter,
};
pub use message::{Message, MessageBuilder};
pub use types::{OffsetAndMetadata, RecordMetadata, TopicPartition};
