//! Timed re-dispatch of consume tasks.

use crate::task::ConsumeTask;
use crate::worker::{SubmitError, TaskSubmitter};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Re-submits tasks after a delay.
///
/// A scheduled task is never dropped while the pool is alive: every
/// rejection sleeps the same delay and tries again.
#[derive(Clone)]
pub(crate) struct RetryScheduler {
    submitter: TaskSubmitter,
}

impl RetryScheduler {
    pub(crate) fn new(submitter: TaskSubmitter) -> Self {
        Self { submitter }
    }

    pub(crate) fn schedule(&self, task: ConsumeTask, delay: Duration) {
        let submitter = self.submitter.clone();
        tokio::spawn(async move {
            let mut task = task;
            loop {
                sleep(delay).await;
                match submitter.try_submit(task) {
                    Ok(()) => return,
                    Err(SubmitError::Full(rejected)) => {
                        warn!(
                            "worker queue still full, holding task for another {:?}",
                            delay
                        );
                        task = rejected;
                    }
                    Err(SubmitError::Closed) => {
                        debug!("pool is gone, dropping deferred task");
                        return;
                    }
                }
            }
        });
    }
}
