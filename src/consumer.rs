//! Public push consumer: wiring, lifecycle and control surface.

use crate::broker::{BrokerConsumer, BrokerProducer, RebalanceHandler};
use crate::buffer::PartitionBuffer;
use crate::config::ConsumerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, Result};
use crate::handler::{ConcurrentHandler, MessageFilter, OrdinalHandler, PermitAllFilter};
use crate::offset::OffsetPersistor;
use crate::poll_loop::{PollHandle, PollLoop};
use crate::retry::RetryScheduler;
use crate::task::{ConsumeServices, HandlerKind};
use crate::topics;
use crate::types::TopicPartition;
use crate::worker::WorkerPool;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Consumer performance counters
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub messages_processed: AtomicU64,
    pub messages_retried: AtomicU64,
    pub messages_dead_lettered: AtomicU64,
    pub messages_filtered: AtomicU64,
    pub handler_failures: AtomicU64,
}

/// Builder for creating push consumers
pub struct PushConsumerBuilder {
    config: Option<ConsumerConfig>,
    broker: Option<Box<dyn BrokerConsumer>>,
    producer: Option<Arc<dyn BrokerProducer>>,
    handler: Option<HandlerKind>,
    filter: Option<Arc<dyn MessageFilter>>,
}

impl PushConsumerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: None,
            broker: None,
            producer: None,
            handler: None,
            filter: None,
        }
    }

    /// Set consumer configuration
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the broker consumer the poll loop will own
    pub fn broker(mut self, broker: Box<dyn BrokerConsumer>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the producer used to republish retries and dead letters
    pub fn producer(mut self, producer: Arc<dyn BrokerProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Register a concurrent batch handler
    pub fn concurrent_handler<H: ConcurrentHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(HandlerKind::Concurrent(Arc::new(handler)));
        self
    }

    /// Register a strictly ordered handler
    pub fn ordinal_handler<H: OrdinalHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(HandlerKind::Ordinal(Arc::new(handler)));
        self
    }

    /// Set a message filter; everything is delivered when unset
    pub fn filter<F: MessageFilter + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Build the consumer. It does not talk to the broker until `start()`.
    pub fn build(self) -> Result<PushConsumer> {
        let config = self.config.unwrap_or_default().validate()?;
        let broker = self
            .broker
            .ok_or_else(|| ClientError::InvalidConfig("Broker consumer is required".to_string()))?;
        let producer = self
            .producer
            .ok_or_else(|| ClientError::InvalidConfig("Producer is required".to_string()))?;

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));
        let retry_topic = topics::retry_topic(&config.group_id);
        let dlq_topic = topics::dead_letter_topic(&config.group_id);
        let buffer = Arc::new(PartitionBuffer::new(config.partition_buffer_capacity));

        Ok(PushConsumer {
            config: Arc::new(config),
            client_id,
            retry_topic,
            dlq_topic,
            buffer,
            metrics: Arc::new(ConsumerMetrics::default()),
            running: Arc::new(AtomicBool::new(false)),
            inner: tokio::sync::Mutex::new(Inner {
                broker: Some(broker),
                producer,
                handler: self.handler,
                filter: self.filter.unwrap_or_else(|| Arc::new(PermitAllFilter)),
                topics: Vec::new(),
                pattern: None,
                handle: None,
                pool: None,
                persistor: None,
                loop_tasks: Vec::new(),
            }),
        })
    }
}

impl Default for PushConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    broker: Option<Box<dyn BrokerConsumer>>,
    producer: Arc<dyn BrokerProducer>,
    handler: Option<HandlerKind>,
    filter: Arc<dyn MessageFilter>,
    topics: Vec<String>,
    pattern: Option<String>,
    handle: Option<PollHandle>,
    pool: Option<WorkerPool>,
    persistor: Option<Arc<OffsetPersistor>>,
    loop_tasks: Vec<JoinHandle<()>>,
}

/// Push-style consumer over a pull-based broker.
///
/// Register a handler, subscribe and start; the client fetches, buffers,
/// dispatches batches to the handler, retries failures over the delay
/// ladder and commits progress.
pub struct PushConsumer {
    config: Arc<ConsumerConfig>,
    client_id: String,
    retry_topic: String,
    dlq_topic: String,
    buffer: Arc<PartitionBuffer>,
    metrics: Arc<ConsumerMetrics>,
    running: Arc<AtomicBool>,
    inner: tokio::sync::Mutex<Inner>,
}

impl PushConsumer {
    /// Create a new builder
    pub fn builder() -> PushConsumerBuilder {
        PushConsumerBuilder::new()
    }

    /// Subscribe to the given topics. The group retry topic is always
    /// added; the dead-letter topic never is.
    pub async fn subscribe<I, T>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut inner = self.inner.lock().await;
        inner.pattern = None;
        inner.topics = topics.into_iter().map(Into::into).collect();
        if self.running.load(Ordering::Acquire) {
            if let Some(handle) = &inner.handle {
                return handle.subscribe(self.subscription(&inner.topics));
            }
        }
        Ok(())
    }

    /// Subscribe to every topic matching the pattern
    pub async fn subscribe_pattern(&self, pattern: &str) -> Result<()> {
        Regex::new(pattern)
            .map_err(|err| ClientError::InvalidConfig(format!("invalid topic pattern: {}", err)))?;
        let mut inner = self.inner.lock().await;
        inner.topics.clear();
        inner.pattern = Some(pattern.to_string());
        if self.running.load(Ordering::Acquire) {
            if let Some(handle) = &inner.handle {
                return handle.subscribe_pattern(self.pattern_with_retry(pattern));
            }
        }
        Ok(())
    }

    /// Drop all subscriptions
    pub async fn unsubscribe(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.topics.clear();
        inner.pattern = None;
        if self.running.load(Ordering::Acquire) {
            if let Some(handle) = &inner.handle {
                return handle.unsubscribe();
            }
        }
        Ok(())
    }

    /// Register a concurrent batch handler. Handlers are fixed once the
    /// consumer started.
    pub async fn register_concurrent_handler<H: ConcurrentHandler + 'static>(
        &self,
        handler: H,
    ) -> Result<()> {
        self.register(HandlerKind::Concurrent(Arc::new(handler)))
            .await
    }

    /// Register a strictly ordered handler
    pub async fn register_ordinal_handler<H: OrdinalHandler + 'static>(
        &self,
        handler: H,
    ) -> Result<()> {
        self.register(HandlerKind::Ordinal(Arc::new(handler))).await
    }

    async fn register(&self, handler: HandlerKind) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(ClientError::InvalidOperation(
                "handlers are fixed once the consumer started".to_string(),
            ));
        }
        self.inner.lock().await.handler = Some(handler);
        Ok(())
    }

    /// Start consuming: subscribe, then bring up the poll loop, the
    /// dispatcher and the offset persistor
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.running.load(Ordering::Acquire) {
            return Err(ClientError::InvalidOperation(
                "consumer is already started".to_string(),
            ));
        }

        let handler = inner.handler.clone().ok_or_else(|| {
            ClientError::Startup("a message handler must be registered before start".to_string())
        })?;
        let mut broker = inner.broker.take().ok_or_else(|| {
            ClientError::Startup("consumer has already been shut down".to_string())
        })?;

        let (handle, commands) = PollHandle::channel();
        let persistor = Arc::new(OffsetPersistor::new(
            &self.config,
            self.buffer.clone(),
            handle.clone(),
            self.running.clone(),
        ));

        let subscribed = match &inner.pattern {
            Some(pattern) => {
                broker
                    .subscribe_pattern(&self.pattern_with_retry(pattern), persistor.clone())
                    .await
            }
            None => {
                broker
                    .subscribe(&self.subscription(&inner.topics), persistor.clone())
                    .await
            }
        };
        if let Err(err) = subscribed {
            // Hand the broker back so a later start can try again.
            inner.broker = Some(broker);
            return Err(ClientError::Startup(format!("subscribe failed: {}", err)));
        }

        let pool = WorkerPool::start(self.config.consume_thread_num, self.config.consume_queue_size);
        let scheduler = RetryScheduler::new(pool.submitter());
        let services = Arc::new(ConsumeServices {
            config: self.config.clone(),
            handler,
            producer: inner.producer.clone(),
            buffer: self.buffer.clone(),
            scheduler: scheduler.clone(),
            retry_topic: self.retry_topic.clone(),
            dlq_topic: self.dlq_topic.clone(),
            metrics: self.metrics.clone(),
        });

        self.running.store(true, Ordering::Release);

        let poll_loop = PollLoop::new(
            broker,
            self.buffer.clone(),
            inner.filter.clone(),
            persistor.clone() as Arc<dyn RebalanceHandler>,
            persistor.clone(),
            commands,
            self.config.clone(),
            self.metrics.clone(),
            self.retry_topic.clone(),
            self.dlq_topic.clone(),
        );
        let dispatcher = Dispatcher::new(
            self.buffer.clone(),
            services,
            pool.submitter(),
            scheduler,
            self.running.clone(),
        );

        inner.loop_tasks = vec![
            tokio::spawn(poll_loop.run()),
            tokio::spawn(dispatcher.run()),
            tokio::spawn(persistor.clone().run()),
        ];
        inner.handle = Some(handle);
        inner.pool = Some(pool);
        inner.persistor = Some(persistor);

        info!(
            "push consumer {} started for group {}",
            self.client_id, self.config.group_id
        );
        Ok(())
    }

    /// Stop fetching without tearing anything down
    pub async fn suspend(&self) -> Result<()> {
        self.with_handle(|handle| handle.suspend()).await
    }

    /// Resume fetching after a suspend
    pub async fn resume(&self) -> Result<()> {
        self.with_handle(|handle| handle.resume()).await
    }

    /// Reposition one partition and discard its buffered state
    pub async fn seek(&self, partition: TopicPartition, offset: u64) -> Result<()> {
        self.with_handle(|handle| handle.seek(partition.clone(), offset))
            .await
    }

    /// Reposition all assigned partitions to their earliest offsets
    pub async fn seek_to_beginning(&self) -> Result<()> {
        self.with_handle(|handle| handle.seek_to_beginning()).await
    }

    /// Reposition all assigned partitions past their latest records
    pub async fn seek_to_end(&self) -> Result<()> {
        self.with_handle(|handle| handle.seek_to_end()).await
    }

    /// Reposition all assigned partitions to the first offset at or after
    /// the given timestamp
    pub async fn seek_to_timestamp(&self, timestamp: u64) -> Result<()> {
        self.with_handle(|handle| handle.seek_to_timestamp(timestamp))
            .await
    }

    /// Graceful shutdown with the default timeout
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_CLOSE_TIMEOUT).await
    }

    /// Immediate shutdown; running handlers are aborted
    pub async fn shutdown_now(&self) -> Result<()> {
        self.shutdown_with_timeout(Duration::ZERO).await
    }

    /// Stop the pipeline: workers drain within the timeout, progress gets
    /// one final flush through the poll loop, then the loops stop
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let (pool, persistor, handle, tasks) = {
            let mut inner = self.inner.lock().await;
            (
                inner.pool.take(),
                inner.persistor.take(),
                inner.handle.take(),
                std::mem::take(&mut inner.loop_tasks),
            )
        };

        // Let in-flight handlers finish so their acks count.
        if let Some(pool) = pool {
            pool.shutdown(timeout).await;
        }

        // Final flush rides the poll loop, which is still draining its
        // command queue; the shutdown command is ordered behind it.
        if let Some(persistor) = &persistor {
            persistor.flush().await;
        }
        if let Some(handle) = &handle {
            let _ = handle.shutdown();
        }

        let grace = self.config.poll_await_timeout + Duration::from_secs(1);
        let deadline = Instant::now() + grace;
        for mut task in tasks {
            if timeout.is_zero() {
                task.abort();
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                warn!("pipeline task did not stop in time, aborting");
                task.abort();
            }
        }

        info!("push consumer {} stopped", self.client_id);
        Ok(())
    }

    /// Consumer performance counters
    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Whether the pipeline is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get client id
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get consumer group id
    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    /// Get configuration
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn subscription(&self, topics: &[String]) -> Vec<String> {
        let mut subscription = topics.to_vec();
        if !subscription.contains(&self.retry_topic) {
            subscription.push(self.retry_topic.clone());
        }
        subscription
    }

    fn pattern_with_retry(&self, pattern: &str) -> String {
        format!("(?:{})|{}", pattern, regex::escape(&self.retry_topic))
    }

    async fn with_handle<F>(&self, send: F) -> Result<()>
    where
        F: FnOnce(&PollHandle) -> Result<()>,
    {
        let inner = self.inner.lock().await;
        match &inner.handle {
            Some(handle) if self.running.load(Ordering::Acquire) => send(handle),
            _ => Err(ClientError::InvalidOperation(
                "consumer is not running".to_string(),
            )),
        }
    }
}
