//! Long-running loop that drains the job queue.

use super::{JobExecutor, JobQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Pulls jobs one at a time and hands them to an executor until shut down.
pub struct QueueWorker {
    queue: Arc<JobQueue>,
    executor: Arc<dyn JobExecutor>,
}

impl QueueWorker {
    pub fn new(queue: Arc<JobQueue>, executor: Arc<dyn JobExecutor>) -> Self {
        Self { queue, executor }
    }

    /// Runs until `shutdown` turns true or its sender is dropped.
    ///
    /// Sleeps for the configured idle interval whenever no job is eligible.
    /// Stale PROCESSING jobs left by crashed workers are released on start and
    /// then once per stale interval. Returns the number of jobs processed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        let idle_sleep = self.queue.config().idle_sleep();
        let stale_after = self.queue.config().stale_after();
        let mut processed = 0usize;
        let mut next_recovery = Instant::now();

        info!("Queue worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_recovery {
                if let Err(e) = self.queue.recover_stale_jobs(stale_after).await {
                    error!("Failed to release stale jobs: {:#}", e);
                }
                next_recovery = Instant::now() + stale_after.max(Duration::from_secs(1));
            }

            let wait = match self.queue.process_next(self.executor.as_ref()).await {
                Ok(Some(job)) => {
                    processed += 1;
                    debug!("Job {} finished as {}", job.job_id, job.status);
                    continue;
                }
                Ok(None) => idle_sleep,
                Err(e) => {
                    error!("Queue worker iteration failed: {:#}", e);
                    idle_sleep
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Queue worker stopped after {} jobs", processed);
        processed
    }

    /// Spawns [`run`](Self::run) on the runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
