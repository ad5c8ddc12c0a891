//! Durable priority queue of embedding jobs.
//!
//! Jobs live in the store, not in memory, so any instance sharing the store
//! can pick them up and a restart loses nothing. Selection is by priority
//! (higher first), then age, then id. A failed attempt is either rescheduled
//! with exponential backoff or, once attempts run out or the error is
//! permanent, marked FAILED.

use crate::storage::{EmbeddingJob, JobId, JobStats, JobStatus, JobStore, NewJob};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use prism_ai_embed::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod worker;

pub use worker::QueueWorker;

/// Why a job attempt failed, and whether trying again can help.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Worth another attempt after a backoff
    #[error("Transient job failure: {message}")]
    Transient { message: String },

    /// Retrying cannot succeed (bad location, invalid configuration)
    #[error("Permanent job failure: {message}")]
    Permanent { message: String },

    /// Storage or source I/O; retried
    #[error("Job infrastructure error: {source}")]
    Infrastructure {
        #[from]
        source: anyhow::Error,
    },
}

impl JobError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Permanent { .. })
    }
}

/// Work performed for a dequeued job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &EmbeddingJob) -> std::result::Result<(), JobError>;
}

/// Queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts per job, including the first
    pub max_attempts: u32,
    pub default_priority: i64,
    /// Poll interval of `await_completion`
    pub await_poll_ms: u64,
    /// Worker sleep when no job is eligible
    pub idle_sleep_ms: u64,
    /// Job-level backoff
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    /// PROCESSING jobs not updated for this long are released
    pub stale_after_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_priority: 0,
            await_poll_ms: 500,
            idle_sleep_ms: 1_000,
            base_delay_ms: 5_000,
            max_delay_ms: 5 * 60 * 1_000,
            jitter: 0.2,
            stale_after_secs: 15 * 60,
        }
    }
}

impl QueueConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_idle_sleep_ms(mut self, idle_sleep_ms: u64) -> Self {
        self.idle_sleep_ms = idle_sleep_ms;
        self
    }

    pub fn with_await_poll_ms(mut self, await_poll_ms: u64) -> Self {
        self.await_poll_ms = await_poll_ms;
        self
    }

    pub fn with_stale_after_secs(mut self, stale_after_secs: u64) -> Self {
        self.stale_after_secs = stale_after_secs;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }

    pub fn await_poll_interval(&self) -> Duration {
        Duration::from_millis(self.await_poll_ms.max(1))
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// How often a running job's lease is refreshed: three times per stale interval.
    pub fn lease_refresh_interval(&self) -> Duration {
        (self.stale_after() / 3).max(Duration::from_millis(100))
    }
}

/// What happened to a job handed to [`JobQueue::process_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
}

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        let policy = config.retry_policy();
        Self {
            store,
            config,
            policy,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Adds a PENDING job.
    pub async fn enqueue(
        &self,
        resource_id: &str,
        source_location: &str,
        correlation_id: &str,
        priority: i64,
        is_reembedding: bool,
    ) -> Result<EmbeddingJob> {
        let job = self
            .store
            .insert_job(&NewJob {
                resource_id: resource_id.to_string(),
                source_location: source_location.to_string(),
                correlation_id: correlation_id.to_string(),
                priority,
                max_attempts: self.config.max_attempts.max(1),
                is_reembedding,
            })
            .await?;
        info!(
            "Enqueued embedding job {} for resource {} (priority {}, correlation {})",
            job.id, job.resource_id, job.priority, job.correlation_id
        );
        Ok(job)
    }

    /// Claims the best eligible job, if any, and marks it PROCESSING.
    pub async fn dequeue_next(&self) -> Result<Option<EmbeddingJob>> {
        let job = self.store.dequeue_next_job(Utc::now()).await?;
        if let Some(job) = &job {
            debug!(
                "Dequeued job {} (attempt {}/{})",
                job.id, job.attempts, job.max_attempts
            );
        }
        Ok(job)
    }

    pub async fn mark_completed(&self, job: &EmbeddingJob) -> Result<JobStatus> {
        if self.store.mark_job_completed(job.id).await? {
            info!("Embedding job {} completed", job.id);
        } else {
            warn!("Job {} was no longer processing when completing", job.id);
        }
        Ok(JobStatus::Completed)
    }

    /// Applies the retry rules to a failed attempt and returns the new status.
    pub async fn record_failure(&self, job: &EmbeddingJob, err: &JobError) -> Result<JobStatus> {
        let message = err.to_string();
        if err.is_retryable() && job.attempts < job.max_attempts {
            let delay = self.policy.jittered_delay(job.attempts);
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.store
                .mark_job_retrying(job.id, available_at, &message)
                .await?;
            warn!(
                "Job {} failed (attempt {}/{}), retrying in {:?}: {}",
                job.id, job.attempts, job.max_attempts, delay, message
            );
            Ok(JobStatus::Retrying)
        } else {
            self.store.mark_job_failed(job.id, &message).await?;
            error!(
                "Job {} failed permanently after {} attempts: {}",
                job.id, job.attempts, message
            );
            Ok(JobStatus::Failed)
        }
    }

    /// Dequeues one job and runs it through `executor`.
    ///
    /// Returns `None` when nothing is eligible. A failing job only affects
    /// its own row.
    pub async fn process_next(&self, executor: &dyn JobExecutor) -> Result<Option<ProcessedJob>> {
        let Some(job) = self.dequeue_next().await? else {
            return Ok(None);
        };

        let status = match self.execute_with_lease(executor, &job).await {
            Ok(()) => self.mark_completed(&job).await?,
            Err(e) => self.record_failure(&job, &e).await?,
        };

        Ok(Some(ProcessedJob {
            job_id: job.id,
            status,
            attempts: job.attempts,
        }))
    }

    /// Runs the executor while refreshing the job's lease, so that stale-job
    /// recovery elsewhere does not hand the same job to a second worker.
    async fn execute_with_lease(
        &self,
        executor: &dyn JobExecutor,
        job: &EmbeddingJob,
    ) -> std::result::Result<(), JobError> {
        let execution = executor.execute(job);
        tokio::pin!(execution);
        let mut lease = tokio::time::interval(self.config.lease_refresh_interval());
        lease.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; dequeue just set the lease
        lease.tick().await;

        loop {
            tokio::select! {
                outcome = &mut execution => return outcome,
                _ = lease.tick() => match self.store.touch_job(job.id).await {
                    Ok(true) => debug!("Refreshed lease of job {}", job.id),
                    Ok(false) => warn!("Job {} is no longer processing, lease not refreshed", job.id),
                    Err(e) => warn!("Failed to refresh lease of job {}: {:#}", job.id, e),
                },
            }
        }
    }

    /// Processes jobs until none is eligible right now. Returns how many ran.
    pub async fn drain(&self, executor: &dyn JobExecutor) -> Result<usize> {
        let mut processed = 0;
        while self.process_next(executor).await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Waits up to `timeout` for the job with `correlation_id` to finish.
    ///
    /// Returns the terminal job, or its last known state on timeout, or `None`
    /// if no such job exists. Timing out leaves the job untouched.
    pub async fn await_completion(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<EmbeddingJob>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(job) = self.store.find_job_by_correlation(correlation_id).await? else {
                return Ok(None);
            };
            if job.status.is_terminal() {
                return Ok(Some(job));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(
                    "Timed out waiting for job {} (status {})",
                    job.id, job.status
                );
                return Ok(Some(job));
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.config.await_poll_interval().min(remaining)).await;
        }
    }

    pub async fn stats(&self) -> Result<JobStats> {
        self.store.job_stats().await
    }

    pub async fn recent_jobs(&self, limit: u32, offset: u32) -> Result<Vec<EmbeddingJob>> {
        self.store.recent_jobs(limit, offset).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<EmbeddingJob>> {
        self.store.get_job(id).await
    }

    pub async fn has_active_job(&self, resource_id: &str) -> Result<bool> {
        self.store.has_active_job(resource_id).await
    }

    /// Releases PROCESSING jobs whose worker stopped updating them for longer
    /// than `older_than`.
    pub async fn recover_stale_jobs(&self, older_than: Duration) -> Result<u64> {
        let older_than =
            chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::days(365));
        let released = self.store.requeue_stale_jobs(Utc::now() - older_than).await?;
        if released > 0 {
            warn!("Released {} stale processing jobs", released);
        }
        Ok(released)
    }
}
