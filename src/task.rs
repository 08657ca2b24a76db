//! One handler invocation over one batch, and the post-processing that
//! turns its outcome into acknowledgments, republishes or deferred
//! retries.

use crate::broker::BrokerProducer;
use crate::buffer::PartitionBuffer;
use crate::config::{ConsumeModel, ConsumerConfig};
use crate::consumer::ConsumerMetrics;
use crate::handler::{
    ConcurrentContext, ConcurrentHandler, ConsumeStatus, OrdinalContext, OrdinalHandler,
};
use crate::message::{Message, HEADER_RESEND_TOPIC};
use crate::retry::RetryScheduler;
use crate::topics::{self, LOCAL_RETRY_DELAY_LEVEL, MAX_RECONSUME_COUNT};
use crate::types::TopicPartition;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Deadline for one republish to the broker
const SEND_BACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything a consume task needs besides its batch
pub(crate) struct ConsumeServices {
    pub(crate) config: Arc<ConsumerConfig>,
    pub(crate) handler: HandlerKind,
    pub(crate) producer: Arc<dyn BrokerProducer>,
    pub(crate) buffer: Arc<PartitionBuffer>,
    pub(crate) scheduler: RetryScheduler,
    pub(crate) retry_topic: String,
    pub(crate) dlq_topic: String,
    pub(crate) metrics: Arc<ConsumerMetrics>,
}

/// The registered handler, deciding which post-processing applies
#[derive(Clone)]
pub(crate) enum HandlerKind {
    Concurrent(Arc<dyn ConcurrentHandler>),
    Ordinal(Arc<dyn OrdinalHandler>),
}

/// One claimed batch on its way through a worker
pub(crate) struct ConsumeTask {
    messages: Vec<Message>,
    partition: TopicPartition,
    services: Arc<ConsumeServices>,
}

impl ConsumeTask {
    pub(crate) fn new(
        messages: Vec<Message>,
        partition: TopicPartition,
        services: Arc<ConsumeServices>,
    ) -> Self {
        Self {
            messages,
            partition,
            services,
        }
    }

    pub(crate) async fn run(self) {
        if self.messages.is_empty() {
            return;
        }
        let handler = self.services.handler.clone();
        match handler {
            HandlerKind::Concurrent(handler) => self.run_concurrent(handler).await,
            HandlerKind::Ordinal(handler) => self.run_ordinal(handler).await,
        }
    }

    async fn run_concurrent(self, handler: Arc<dyn ConcurrentHandler>) {
        let first_offset = self.messages[0].offset;
        let ctx = ConcurrentContext::new(self.partition.clone(), first_offset, self.messages.len());

        // Batches from the retry topic are handed to the handler under
        // their original topic and partition; acknowledgment keeps using
        // the retry-topic placement.
        let batch: Vec<Message> = if self.partition.topic == self.services.retry_topic {
            self.messages.iter().map(Message::rehydrate).collect()
        } else {
            self.messages.clone()
        };

        let status = self
            .invoke(AssertUnwindSafe(handler.consume_message(batch, &ctx)))
            .await;
        self.process_concurrent(status, &ctx).await;
    }

    async fn run_ordinal(self, handler: Arc<dyn OrdinalHandler>) {
        let first_offset = self.messages[0].offset;
        let ctx = OrdinalContext::new(self.partition.clone(), first_offset);

        let status = self
            .invoke(AssertUnwindSafe(
                handler.consume_message(self.messages.clone(), &ctx),
            ))
            .await;

        match status {
            ConsumeStatus::Success => {
                let offsets: Vec<u64> = self.messages.iter().map(|m| m.offset).collect();
                self.services.buffer.ack(&self.partition, &offsets);
                self.services
                    .metrics
                    .messages_processed
                    .fetch_add(offsets.len() as u64, Ordering::Relaxed);
            }
            ConsumeStatus::RetryLater => {
                let suspend = Duration::from_millis(ctx.suspend_ms());
                debug!(
                    "suspending {} for {:?} before ordered redelivery",
                    self.partition, suspend
                );
                sleep(suspend).await;
                self.services
                    .buffer
                    .requeue_front(&self.partition, self.messages);
            }
        }
    }

    /// Drive the handler future under the deal-time budget, containing
    /// panics. Timeouts, panics and errors all resolve to a retry.
    async fn invoke<F>(&self, fut: F) -> ConsumeStatus
    where
        F: std::future::Future<Output = crate::error::Result<ConsumeStatus>> + std::panic::UnwindSafe,
    {
        let deal_time = self.services.config.max_message_deal_time;
        match timeout(deal_time, fut.catch_unwind()).await {
            Ok(Ok(Ok(status))) => status,
            Ok(Ok(Err(err))) => {
                warn!("handler failed on {}: {}", self.partition, err);
                self.services
                    .metrics
                    .handler_failures
                    .fetch_add(1, Ordering::Relaxed);
                ConsumeStatus::RetryLater
            }
            Ok(Err(_panic)) => {
                warn!("handler panicked on {}", self.partition);
                self.services
                    .metrics
                    .handler_failures
                    .fetch_add(1, Ordering::Relaxed);
                ConsumeStatus::RetryLater
            }
            Err(_) => {
                info!(
                    "handler ran past {:?} on {}, cancelled",
                    deal_time, self.partition
                );
                self.services
                    .metrics
                    .handler_failures
                    .fetch_add(1, Ordering::Relaxed);
                ConsumeStatus::RetryLater
            }
        }
    }

    async fn process_concurrent(&self, status: ConsumeStatus, ctx: &ConcurrentContext) {
        match status {
            ConsumeStatus::Success => {
                let offsets: Vec<u64> = self.messages.iter().map(|m| m.offset).collect();
                self.services.buffer.ack(&self.partition, &offsets);
                self.services
                    .metrics
                    .messages_processed
                    .fetch_add(offsets.len() as u64, Ordering::Relaxed);
            }
            ConsumeStatus::RetryLater => self.process_retry_later(ctx).await,
        }
    }

    async fn process_retry_later(&self, ctx: &ConcurrentContext) {
        let config = &self.services.config;
        let metrics = &self.services.metrics;
        let mut ack_offsets = Vec::with_capacity(self.messages.len());
        let mut local_retry = Vec::new();

        for (idx, message) in self.messages.iter().enumerate() {
            if ctx.is_marked_success(idx) {
                ack_offsets.push(message.offset);
                metrics.messages_processed.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut msg = message.clone();
            let delay_level = ctx
                .delay_level_override()
                .unwrap_or_else(|| msg.retry_count() + 1);

            if msg.retry_count() < MAX_RECONSUME_COUNT {
                msg.stamp_real_placement();
                msg.increment_retry_count();

                let sent = match config.consume_model {
                    ConsumeModel::Clustering => {
                        self.send_message_back(&self.services.retry_topic, msg.clone(), delay_level)
                            .await
                    }
                    // Broadcasting has no shared retry topic; the message
                    // stays local and re-runs through the handler.
                    ConsumeModel::Broadcasting => false,
                };

                if sent {
                    metrics.messages_retried.fetch_add(1, Ordering::Relaxed);
                    ack_offsets.push(message.offset);
                } else {
                    local_retry.push(msg);
                }
            } else {
                match config.consume_model {
                    ConsumeModel::Clustering => {
                        let sent = self
                            .send_message_back(&self.services.dlq_topic, msg.clone(), 0)
                            .await;
                        if sent {
                            metrics.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
                            ack_offsets.push(message.offset);
                        } else if config.dlq_publish_failure_blocks {
                            warn!(
                                "dead letter publish failed for message {}, keeping it in flight",
                                msg.id
                            );
                            local_retry.push(msg);
                        } else {
                            warn!(
                                "dead letter publish failed for message {}, acknowledging anyway",
                                msg.id
                            );
                            ack_offsets.push(message.offset);
                        }
                    }
                    ConsumeModel::Broadcasting => {
                        warn!(
                            "message {} exceeded {} delivery attempts, dropping",
                            msg.id, MAX_RECONSUME_COUNT
                        );
                        ack_offsets.push(message.offset);
                    }
                }
            }
        }

        if !ack_offsets.is_empty() {
            self.services.buffer.ack(&self.partition, &ack_offsets);
        }

        // Unacknowledged offsets keep the partition watermark where it is;
        // persistent republish failure eventually fills the buffer and the
        // poll loop pauses the partition.
        if !local_retry.is_empty() {
            debug!(
                "{} messages held for local retry on {}",
                local_retry.len(),
                self.partition
            );
            let retry_task = ConsumeTask::new(
                local_retry,
                self.partition.clone(),
                self.services.clone(),
            );
            self.services
                .scheduler
                .schedule(retry_task, topics::delay_duration(LOCAL_RETRY_DELAY_LEVEL));
        }
    }

    /// Republish one message, either straight to `target` or onto the
    /// delay-level topic pointing back at it. Returns whether the broker
    /// confirmed within the publish deadline.
    async fn send_message_back(&self, target: &str, mut msg: Message, delay_level: u32) -> bool {
        match topics::delay_topic(delay_level) {
            Some(delayed_topic) => {
                msg.set_header(HEADER_RESEND_TOPIC, target.to_string());
                msg.set_delay_level(delay_level);
                msg.topic = delayed_topic;
            }
            None => {
                msg.topic = target.to_string();
            }
        }

        let topic = msg.topic.clone();
        match timeout(SEND_BACK_TIMEOUT, self.services.producer.send(msg)).await {
            Ok(Ok(placement)) => {
                debug!(
                    "republished to {} at partition {} offset {}",
                    topic, placement.partition, placement.offset
                );
                true
            }
            Ok(Err(err)) => {
                warn!("republish to {} failed: {}", topic, err);
                false
            }
            Err(_) => {
                warn!(
                    "republish to {} timed out after {:?}",
                    topic, SEND_BACK_TIMEOUT
                );
                false
            }
        }
    }
}
