//! Turns per-partition ack progress into durable commits, and handles
//! consumer group rebalances.
//!
//! Clustering mode relays commits to the broker through the poll loop so
//! every broker call stays on one task. Broadcasting mode writes one small
//! file per partition instead, replaced atomically on each flush.

use crate::broker::RebalanceHandler;
use crate::buffer::PartitionBuffer;
use crate::config::{ConsumeModel, ConsumerConfig};
use crate::error::Result;
use crate::poll_loop::PollHandle;
use crate::types::{OffsetAndMetadata, TopicPartition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub(crate) struct OffsetPersistor {
    buffer: Arc<PartitionBuffer>,
    commands: PollHandle,
    file_store: Option<OffsetFileStore>,
    commit_interval: Duration,
    running: Arc<AtomicBool>,
}

impl OffsetPersistor {
    pub(crate) fn new(
        config: &ConsumerConfig,
        buffer: Arc<PartitionBuffer>,
        commands: PollHandle,
        running: Arc<AtomicBool>,
    ) -> Self {
        let file_store = match config.consume_model {
            ConsumeModel::Broadcasting => Some(OffsetFileStore::new(
                config.offset_store_dir.join(&config.group_id),
            )),
            ConsumeModel::Clustering => None,
        };

        Self {
            buffer,
            commands,
            file_store,
            commit_interval: config.commit_interval,
            running,
        }
    }

    /// Periodic flush task
    pub(crate) async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.commit_interval);
        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.flush().await;
        }
        debug!("offset persistor stopped");
    }

    /// Flush whatever progress accumulated since the last call
    pub(crate) async fn flush(&self) {
        let partitions = self.buffer.partitions();
        let commits = self.collect(&partitions).await;
        if commits.is_empty() {
            return;
        }
        if self.commands.commit(commits).is_err() {
            debug!("poll loop is gone, pending commits dropped");
        }
    }

    /// Gather advanced watermarks. Broadcasting persists them to files as a
    /// side effect and the returned map stays empty.
    async fn collect(
        &self,
        partitions: &[TopicPartition],
    ) -> HashMap<TopicPartition, OffsetAndMetadata> {
        let mut commits = HashMap::new();
        for partition in partitions {
            let Some(offset) = self.buffer.take_commit(partition) else {
                continue;
            };
            match &self.file_store {
                Some(store) => {
                    if let Err(err) = store.persist(partition, offset).await {
                        warn!("offset file write failed for {}: {}", partition, err);
                    }
                }
                None => {
                    commits.insert(partition.clone(), OffsetAndMetadata::new(offset, None));
                }
            }
        }
        commits
    }

    /// Drop persisted progress for one partition (after a seek)
    pub(crate) async fn forget(&self, partition: &TopicPartition) {
        if let Some(store) = &self.file_store {
            store.remove(partition).await;
        }
    }

    /// Drop all persisted progress
    pub(crate) async fn clear(&self) {
        if let Some(store) = &self.file_store {
            store.clear().await;
        }
    }
}

#[async_trait]
impl RebalanceHandler for OffsetPersistor {
    async fn on_partitions_revoked(
        &self,
        partitions: &[TopicPartition],
    ) -> HashMap<TopicPartition, OffsetAndMetadata> {
        info!("partitions revoked: {:?}", partitions);
        let commits = self.collect(partitions).await;
        for partition in partitions {
            self.buffer.reset(partition);
        }
        // Tasks still running on these partitions complete, but their acks
        // hit a reset buffer and are dropped.
        commits
    }

    async fn on_partitions_assigned(
        &self,
        partitions: &[TopicPartition],
    ) -> HashMap<TopicPartition, u64> {
        info!("partitions assigned: {:?}", partitions);
        let mut seeks = HashMap::new();
        if let Some(store) = &self.file_store {
            for partition in partitions {
                if let Some(offset) = store.load(partition).await {
                    seeks.insert(partition.clone(), offset);
                }
            }
        }
        seeks
    }
}

/// One decimal offset per partition, written via temp file and rename
struct OffsetFileStore {
    dir: PathBuf,
}

impl OffsetFileStore {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, partition: &TopicPartition) -> PathBuf {
        self.dir
            .join(format!("{}-{}.offset", partition.topic, partition.partition))
    }

    async fn persist(&self, partition: &TopicPartition, offset: u64) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(partition);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, offset.to_string()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, partition: &TopicPartition) -> Option<u64> {
        let raw = tokio::fs::read_to_string(self.path(partition)).await.ok()?;
        raw.trim().parse().ok()
    }

    async fn remove(&self, partition: &TopicPartition) {
        let _ = tokio::fs::remove_file(self.path(partition)).await;
    }

    async fn clear(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().extension().is_some_and(|ext| ext == "offset") {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}
