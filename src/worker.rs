//! Bounded pool of worker tasks executing handler invocations.

use crate::task::ConsumeTask;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why a task could not be queued
pub(crate) enum SubmitError {
    /// The queue is full; the task is handed back for re-dispatch
    Full(ConsumeTask),
    /// The pool is shutting down
    Closed,
}

/// Cloneable submit side of the pool queue
#[derive(Clone)]
pub(crate) struct TaskSubmitter {
    queue: mpsc::Sender<ConsumeTask>,
    shutdown: watch::Receiver<bool>,
}

impl TaskSubmitter {
    pub(crate) fn try_submit(&self, task: ConsumeTask) -> Result<(), SubmitError> {
        if *self.shutdown.borrow() {
            return Err(SubmitError::Closed);
        }
        match self.queue.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(task)) => Err(SubmitError::Full(task)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }
}

/// Fixed set of worker tasks fed from one bounded queue.
///
/// A full queue surfaces as a rejection on submit rather than blocking the
/// dispatcher.
pub(crate) struct WorkerPool {
    submitter: TaskSubmitter,
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub(crate) fn start(worker_count: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<ConsumeTask>(queue_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..worker_count)
            .map(|worker_id| {
                let queue = rx.clone();
                let mut shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        let task = {
                            let mut queue = queue.lock().await;
                            tokio::select! {
                                task = queue.recv() => task,
                                changed = shutdown.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                    continue;
                                }
                            }
                        };
                        let Some(task) = task else { break };
                        task.run().await;
                    }
                    debug!("consume worker {} exited", worker_id);
                })
            })
            .collect();

        Self {
            submitter: TaskSubmitter {
                queue: tx,
                shutdown: shutdown_rx,
            },
            workers,
            shutdown: shutdown_tx,
        }
    }

    pub(crate) fn submitter(&self) -> TaskSubmitter {
        self.submitter.clone()
    }

    /// Stop the pool. With a non-zero timeout, workers finish their current
    /// handler invocation and are awaited up to the deadline; queued tasks
    /// are discarded either way.
    pub(crate) async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown.send(true);

        if timeout.is_zero() {
            for worker in &self.workers {
                worker.abort();
            }
            return;
        }

        let deadline = Instant::now() + timeout;
        for mut worker in self.workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut worker).await.is_err() {
                warn!("consume worker did not stop in time, aborting");
                worker.abort();
            }
        }
    }
}
