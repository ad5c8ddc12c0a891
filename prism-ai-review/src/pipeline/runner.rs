//! Executes embedding jobs pulled from the queue.

use super::{ContentSource, EmbedTarget, EmbeddingPipeline, PipelineItem, PipelineReport};
use crate::queue::{JobError, JobExecutor};
use crate::storage::{EmbeddingJob, EmbeddingStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Fetches a job's repository content, embeds it and persists the records.
///
/// Failure classification:
/// - source fetch or store errors are transient
/// - every chunk failing with a retryable error (including an open circuit) is transient
/// - every chunk failing with a non-retryable error is permanent
/// - partial success keeps the records that were produced and completes the job
pub struct EmbeddingJobRunner {
    source: Arc<dyn ContentSource>,
    pipeline: Arc<EmbeddingPipeline>,
    store: Arc<dyn EmbeddingStore>,
}

impl EmbeddingJobRunner {
    pub fn new(
        source: Arc<dyn ContentSource>,
        pipeline: Arc<EmbeddingPipeline>,
        store: Arc<dyn EmbeddingStore>,
    ) -> Self {
        Self {
            source,
            pipeline,
            store,
        }
    }

    fn classify_total_failure(job: &EmbeddingJob, report: &PipelineReport) -> JobError {
        let first = report
            .failures
            .first()
            .map(|f| format!("{}: {}", f.path, f.reason))
            .unwrap_or_default();
        let message = format!(
            "all {} chunks of resource {} failed to embed (first: {})",
            report.failures.len(),
            job.resource_id,
            first
        );
        if report.failures.iter().any(|f| f.retryable) {
            JobError::transient(message)
        } else {
            JobError::permanent(message)
        }
    }
}

#[async_trait]
impl JobExecutor for EmbeddingJobRunner {
    async fn execute(&self, job: &EmbeddingJob) -> Result<(), JobError> {
        let snapshot = self
            .source
            .fetch(&job.resource_id, &job.source_location, None)
            .await
            .map_err(|e| JobError::transient(format!("source fetch failed: {e:#}")))?;

        if snapshot.files.is_empty() {
            info!("Resource {} has no files to embed", job.resource_id);
            return Ok(());
        }

        let target = EmbedTarget {
            resource_id: job.resource_id.clone(),
            revision_id: snapshot.revision,
            branch: snapshot.branch,
        };
        let items = snapshot
            .files
            .into_iter()
            .map(|f| PipelineItem::new(f.path, f.content))
            .collect();
        let report = self.pipeline.embed(&target, items).await;

        if report.all_failed() {
            return Err(Self::classify_total_failure(job, &report));
        }
        if !report.failures.is_empty() {
            warn!(
                "{} of {} chunks for resource {} failed to embed",
                report.failures.len(),
                report.chunks_attempted,
                job.resource_id
            );
        }

        let stored = if job.is_reembedding && !report.records.is_empty() {
            self.store
                .replace_records_for_resource(&job.resource_id, &report.records)
                .await?
        } else {
            self.store.upsert_records(&report.records).await?
        };
        info!(
            "Stored {} records for resource {} at {}",
            stored, job.resource_id, target.revision_id
        );
        Ok(())
    }
}
