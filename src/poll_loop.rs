//! The single task that talks to the broker.
//!
//! The broker consumer is not safe to share, so it lives inside this loop
//! and everything else reaches it through [`PollHandle`] commands. Seeks,
//! subscription changes and commits are applied between fetches, which
//! both serializes them and makes their ordering explicit.

use crate::broker::{BrokerConsumer, RebalanceHandler};
use crate::buffer::PartitionBuffer;
use crate::config::ConsumerConfig;
use crate::consumer::ConsumerMetrics;
use crate::error::{ClientError, Result};
use crate::handler::MessageFilter;
use crate::message::Message;
use crate::offset::OffsetPersistor;
use crate::types::{OffsetAndMetadata, TopicPartition};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Control operations shipped into the poll loop
#[derive(Debug)]
pub(crate) enum PollCommand {
    Suspend,
    Resume,
    Subscribe(Vec<String>),
    SubscribePattern(String),
    Unsubscribe,
    Seek(TopicPartition, u64),
    SeekToBeginning,
    SeekToEnd,
    SeekToTimestamp(u64),
    Commit(HashMap<TopicPartition, OffsetAndMetadata>),
    Shutdown,
}

/// Cloneable sender of poll loop commands
#[derive(Clone)]
pub(crate) struct PollHandle {
    tx: mpsc::UnboundedSender<PollCommand>,
}

impl PollHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<PollCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, command: PollCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| ClientError::InvalidOperation("consumer is not running".to_string()))
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        self.send(PollCommand::Suspend)
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.send(PollCommand::Resume)
    }

    pub(crate) fn subscribe(&self, topics: Vec<String>) -> Result<()> {
        self.send(PollCommand::Subscribe(topics))
    }

    pub(crate) fn subscribe_pattern(&self, pattern: String) -> Result<()> {
        self.send(PollCommand::SubscribePattern(pattern))
    }

    pub(crate) fn unsubscribe(&self) -> Result<()> {
        self.send(PollCommand::Unsubscribe)
    }

    pub(crate) fn seek(&self, partition: TopicPartition, offset: u64) -> Result<()> {
        self.send(PollCommand::Seek(partition, offset))
    }

    pub(crate) fn seek_to_beginning(&self) -> Result<()> {
        self.send(PollCommand::SeekToBeginning)
    }

    pub(crate) fn seek_to_end(&self) -> Result<()> {
        self.send(PollCommand::SeekToEnd)
    }

    pub(crate) fn seek_to_timestamp(&self, timestamp: u64) -> Result<()> {
        self.send(PollCommand::SeekToTimestamp(timestamp))
    }

    pub(crate) fn commit(&self, offsets: HashMap<TopicPartition, OffsetAndMetadata>) -> Result<()> {
        self.send(PollCommand::Commit(offsets))
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        self.send(PollCommand::Shutdown)
    }
}

pub(crate) struct PollLoop {
    consumer: Box<dyn BrokerConsumer>,
    buffer: Arc<PartitionBuffer>,
    filter: Arc<dyn MessageFilter>,
    rebalance: Arc<dyn RebalanceHandler>,
    persistor: Arc<OffsetPersistor>,
    commands: mpsc::UnboundedReceiver<PollCommand>,
    config: Arc<ConsumerConfig>,
    metrics: Arc<ConsumerMetrics>,
    retry_topic: String,
    dlq_topic: String,
    suspended: bool,
}

impl PollLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        consumer: Box<dyn BrokerConsumer>,
        buffer: Arc<PartitionBuffer>,
        filter: Arc<dyn MessageFilter>,
        rebalance: Arc<dyn RebalanceHandler>,
        persistor: Arc<OffsetPersistor>,
        commands: mpsc::UnboundedReceiver<PollCommand>,
        config: Arc<ConsumerConfig>,
        metrics: Arc<ConsumerMetrics>,
        retry_topic: String,
        dlq_topic: String,
    ) -> Self {
        Self {
            consumer,
            buffer,
            filter,
            rebalance,
            persistor,
            commands,
            config,
            metrics,
            retry_topic,
            dlq_topic,
            suspended: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("poll loop started");
        loop {
            // Control first, so seeks and commits never wait on a fetch.
            loop {
                match self.commands.try_recv() {
                    Ok(command) => {
                        if self.apply(command).await {
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }

            if self.suspended {
                // No fetching until resumed; park on the command channel.
                match self.commands.recv().await {
                    Some(command) => {
                        if self.apply(command).await {
                            return;
                        }
                        continue;
                    }
                    None => return,
                }
            }

            let need_pause = match self.consumer.poll(self.config.poll_await_timeout).await {
                Ok(records) => self.deliver(records),
                Err(err) => {
                    warn!("broker poll failed: {}", err);
                    HashSet::new()
                }
            };

            if let Err(err) = self.reconcile_pauses(need_pause).await {
                warn!("pause/resume reconciliation failed: {}", err);
            }
        }
    }

    /// Filter and buffer one poll's worth of records; returns the
    /// partitions the store reported as full.
    fn deliver(&self, records: Vec<Message>) -> HashSet<TopicPartition> {
        if records.is_empty() {
            return HashSet::new();
        }

        self.metrics
            .messages_received
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        let bytes: u64 = records.iter().map(|m| m.size as u64).sum();
        self.metrics
            .bytes_received
            .fetch_add(bytes, Ordering::Relaxed);

        let survivors = self.filter_records(records);
        self.buffer.store(survivors)
    }

    fn filter_records(&self, records: Vec<Message>) -> Vec<Message> {
        let permit_all = self.filter.is_permit_all();
        records
            .into_iter()
            .filter(|msg| {
                // Nothing from the dead-letter topic may re-enter the
                // pipeline, whatever the subscription matched.
                if msg.topic == self.dlq_topic {
                    warn!(
                        "dead letter record at offset {} reached the consumer, dropping",
                        msg.offset
                    );
                    self.metrics
                        .messages_filtered
                        .fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                if permit_all {
                    return true;
                }
                let deliver = self.filter.can_deliver(&msg.payload, &msg.headers);
                if !deliver {
                    self.metrics
                        .messages_filtered
                        .fetch_add(1, Ordering::Relaxed);
                }
                deliver
            })
            .collect()
    }

    /// Pause partitions at capacity, resume paused ones that drained below
    /// the hysteresis threshold.
    async fn reconcile_pauses(&mut self, mut need_pause: HashSet<TopicPartition>) -> Result<()> {
        let paused = self.consumer.paused();
        for partition in &paused {
            if !self.buffer.below_resume_threshold(partition) {
                need_pause.insert(partition.clone());
            }
        }

        let resume: Vec<TopicPartition> = paused
            .iter()
            .filter(|p| !need_pause.contains(*p))
            .cloned()
            .collect();
        if !resume.is_empty() {
            debug!("resuming {:?}", resume);
            self.consumer.resume(&resume).await?;
        }

        let pause: Vec<TopicPartition> = need_pause.into_iter().collect();
        if !pause.is_empty() {
            debug!("pausing {:?}", pause);
            self.consumer.pause(&pause).await?;
        }
        Ok(())
    }

    /// Apply one control command; returns true when the loop must stop
    async fn apply(&mut self, command: PollCommand) -> bool {
        match command {
            PollCommand::Suspend => {
                info!("polling suspended");
                self.suspended = true;
            }
            PollCommand::Resume => {
                info!("polling resumed");
                self.suspended = false;
            }
            PollCommand::Subscribe(topics) => {
                if let Err(err) = self
                    .consumer
                    .subscribe(&topics, self.rebalance.clone())
                    .await
                {
                    warn!("subscribe failed: {}", err);
                }
            }
            PollCommand::SubscribePattern(pattern) => {
                if let Err(err) = self
                    .consumer
                    .subscribe_pattern(&pattern, self.rebalance.clone())
                    .await
                {
                    warn!("pattern subscribe failed: {}", err);
                }
            }
            PollCommand::Unsubscribe => {
                if let Err(err) = self.consumer.unsubscribe().await {
                    warn!("unsubscribe failed: {}", err);
                }
            }
            PollCommand::Seek(partition, offset) => {
                info!("{} seeking to {}", partition, offset);
                match self.consumer.seek(&partition, offset).await {
                    Ok(()) => {
                        self.buffer.reset(&partition);
                        self.persistor.forget(&partition).await;
                    }
                    Err(err) => warn!("seek failed for {}: {}", partition, err),
                }
            }
            PollCommand::SeekToBeginning => {
                let partitions = self.seekable_partitions();
                match self.consumer.seek_to_beginning(&partitions).await {
                    Ok(()) => Self::reset_after_seek(&self.buffer, &self.persistor).await,
                    Err(err) => warn!("seek to beginning failed: {}", err),
                }
            }
            PollCommand::SeekToEnd => {
                let partitions = self.seekable_partitions();
                match self.consumer.seek_to_end(&partitions).await {
                    Ok(()) => Self::reset_after_seek(&self.buffer, &self.persistor).await,
                    Err(err) => warn!("seek to end failed: {}", err),
                }
            }
            PollCommand::SeekToTimestamp(timestamp) => {
                let request: HashMap<TopicPartition, u64> = self
                    .seekable_partitions()
                    .into_iter()
                    .map(|p| (p, timestamp))
                    .collect();
                match self.consumer.offsets_for_times(request).await {
                    Ok(offsets) => {
                        for (partition, offset) in offsets {
                            if let Err(err) = self.consumer.seek(&partition, offset).await {
                                warn!("seek failed for {}: {}", partition, err);
                            }
                        }
                        Self::reset_after_seek(&self.buffer, &self.persistor).await;
                    }
                    Err(err) => warn!("offset lookup by time failed: {}", err),
                }
            }
            PollCommand::Commit(offsets) => {
                if let Err(err) = self.consumer.commit_sync(&offsets).await {
                    warn!("offset commit failed: {}", err);
                }
            }
            PollCommand::Shutdown => {
                info!("poll loop stopping");
                return true;
            }
        }
        false
    }

    /// Assigned partitions minus the retry topic, which follows its own
    /// progress and is never repositioned by user seeks
    fn seekable_partitions(&self) -> Vec<TopicPartition> {
        self.consumer
            .assignment()
            .into_iter()
            .filter(|p| p.topic != self.retry_topic)
            .collect()
    }

    async fn reset_after_seek(buffer: &Arc<PartitionBuffer>, persistor: &Arc<OffsetPersistor>) {
        buffer.reset_all();
        persistor.clear().await;
    }
}
