//! Hands ready batches from the partition buffer to the worker pool.

use crate::buffer::PartitionBuffer;
use crate::retry::RetryScheduler;
use crate::task::{ConsumeServices, ConsumeTask};
use crate::worker::{SubmitError, TaskSubmitter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Single task scanning partitions and submitting batches.
///
/// Partitions are visited round-robin from a rotating start so one busy
/// partition cannot starve the others.
pub(crate) struct Dispatcher {
    buffer: Arc<PartitionBuffer>,
    services: Arc<ConsumeServices>,
    submitter: TaskSubmitter,
    scheduler: RetryScheduler,
    running: Arc<AtomicBool>,
    batch_size: usize,
    retry_backoff: Duration,
    cursor: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        buffer: Arc<PartitionBuffer>,
        services: Arc<ConsumeServices>,
        submitter: TaskSubmitter,
        scheduler: RetryScheduler,
        running: Arc<AtomicBool>,
    ) -> Self {
        let batch_size = services.config.consume_batch_size;
        let retry_backoff = services.config.client_task_retry_backoff;
        Self {
            buffer,
            services,
            submitter,
            scheduler,
            running,
            batch_size,
            retry_backoff,
            cursor: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("dispatcher started");
        while self.running.load(Ordering::Acquire) {
            if !self.scan() {
                tokio::select! {
                    _ = self.buffer.ready().notified() => {}
                    _ = sleep(IDLE_WAIT) => {}
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// One pass over all partitions; returns whether anything was handed out
    fn scan(&mut self) -> bool {
        let partitions = self.buffer.partitions();
        if partitions.is_empty() {
            return false;
        }

        let count = partitions.len();
        let mut dispatched = false;
        for step in 0..count {
            let partition = &partitions[(self.cursor + step) % count];
            let Some(batch) = self.buffer.drain_ready(partition, self.batch_size) else {
                continue;
            };
            dispatched = true;

            let task = ConsumeTask::new(batch, partition.clone(), self.services.clone());
            match self.submitter.try_submit(task) {
                Ok(()) => {}
                Err(SubmitError::Full(task)) => {
                    warn!(
                        "worker queue full, re-dispatching {} in {:?}",
                        partition, self.retry_backoff
                    );
                    self.scheduler.schedule(task, self.retry_backoff);
                }
                Err(SubmitError::Closed) => return dispatched,
            }
        }
        self.cursor = (self.cursor + 1) % count;
        dispatched
    }
}
