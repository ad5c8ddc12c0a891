//! Storage abstraction layer for prism-ai-review
//!
//! Services never talk to the database directly. They hold `Arc<dyn Trait>`
//! handles to the three stores below, which keeps the intake guard, queue and
//! retrieval engine testable against any backend.
//!
//! ## Key Components
//!
//! - **ClaimStore**: insert-if-absent claims keyed by event fingerprint
//! - **JobStore**: durable embedding jobs with an atomic dequeue
//! - **EmbeddingStore**: per-file vectors with nearest-neighbour search
//!
//! ## Architecture
//!
//! ```text
//! ClaimStore ─────┐
//! JobStore ───────┼── SqliteStore (concrete implementation)
//! EmbeddingStore ─┘
//! ```

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod sqlite_store;

/// Database ID of a claim.
pub type ClaimId = i64;

/// Database ID of an embedding job.
pub type JobId = i64;

/// Lifecycle of a processing claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Active,
    Completed,
    Failed,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Active => "ACTIVE",
            ClaimStatus::Completed => "COMPLETED",
            ClaimStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for ClaimStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(ClaimStatus::Active),
            "COMPLETED" => Ok(ClaimStatus::Completed),
            "FAILED" => Ok(ClaimStatus::Failed),
            other => Err(anyhow!("unknown claim status: {other}")),
        }
    }
}

/// Record that one instance is processing one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingClaim {
    pub id: ClaimId,
    pub fingerprint: String,
    pub event_kind: String,
    pub resource_id: String,
    pub status: ClaimStatus,
    pub owner_instance_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Fields of a claim about to be inserted.
#[derive(Debug, Clone)]
pub struct NewClaim {
    pub fingerprint: String,
    pub event_kind: String,
    pub resource_id: String,
    pub owner_instance_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimStats {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Lifecycle of an embedding job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Completed and failed jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "RETRYING" => Ok(JobStatus::Retrying),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(anyhow!("unknown job status: {other}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of asynchronous embedding work for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: JobId,
    pub resource_id: String,
    pub source_location: String,
    /// External handle callers use to await the job
    pub correlation_id: String,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub is_reembedding: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be dequeued
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub resource_id: String,
    pub source_location: String,
    pub correlation_id: String,
    pub priority: i64,
    pub max_attempts: u32,
    pub is_reembedding: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// A stored vector for one file (or file chunk) of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub resource_id: String,
    /// File path, with a `#chunkN` suffix for chunks of large files
    pub file_path: String,
    pub content: String,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub language: String,
    pub revision_id: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a record about to be written. Records are keyed by
/// `(resource_id, file_path, branch)`; writing the same key again replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEmbeddingRecord {
    pub resource_id: String,
    pub file_path: String,
    pub content: String,
    pub vector: Vec<f32>,
    pub language: String,
    pub revision_id: String,
    pub branch: String,
}

/// Claim operations used by the intake guard.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Insert an ACTIVE claim unless one already exists for the fingerprint.
    ///
    /// Returns `None` when another ACTIVE claim holds the fingerprint. The check
    /// and the insert are a single atomic statement.
    async fn try_insert_claim(&self, claim: &NewClaim) -> Result<Option<ProcessingClaim>>;

    async fn get_claim(&self, id: ClaimId) -> Result<Option<ProcessingClaim>>;

    async fn find_active_claim(&self, fingerprint: &str) -> Result<Option<ProcessingClaim>>;

    /// Move an ACTIVE claim to a terminal status. Returns false if the claim is
    /// missing or no longer ACTIVE.
    async fn finish_claim(
        &self,
        id: ClaimId,
        status: ClaimStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;

    /// Fail every ACTIVE claim started before `started_before`.
    async fn fail_stale_claims(&self, started_before: DateTime<Utc>, message: &str) -> Result<u64>;

    async fn claim_stats(&self) -> Result<ClaimStats>;
}

/// Durable queue operations. Status transitions are conditional on the
/// current status so that concurrent workers cannot overwrite each other.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &NewJob) -> Result<EmbeddingJob>;

    /// Atomically pick the best eligible job, mark it PROCESSING and count the attempt.
    async fn dequeue_next_job(&self, now: DateTime<Utc>) -> Result<Option<EmbeddingJob>>;

    async fn get_job(&self, id: JobId) -> Result<Option<EmbeddingJob>>;

    /// Most recent job carrying the correlation id.
    async fn find_job_by_correlation(&self, correlation_id: &str) -> Result<Option<EmbeddingJob>>;

    async fn mark_job_completed(&self, id: JobId) -> Result<bool>;

    async fn mark_job_retrying(
        &self,
        id: JobId,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool>;

    async fn mark_job_failed(&self, id: JobId, error: &str) -> Result<bool>;

    /// Refresh the lease of a PROCESSING job. Returns false once the job has
    /// left PROCESSING.
    async fn touch_job(&self, id: JobId) -> Result<bool>;

    /// Release PROCESSING jobs not updated since `updated_before`: back to
    /// RETRYING, or FAILED when no attempts remain.
    async fn requeue_stale_jobs(&self, updated_before: DateTime<Utc>) -> Result<u64>;

    async fn job_stats(&self) -> Result<JobStats>;

    /// Newest first.
    async fn recent_jobs(&self, limit: u32, offset: u32) -> Result<Vec<EmbeddingJob>>;

    /// Whether a PENDING, PROCESSING or RETRYING job exists for the resource.
    async fn has_active_job(&self, resource_id: &str) -> Result<bool>;
}

/// Vector storage and similarity search.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Insert or replace records by `(resource_id, file_path, branch)`.
    ///
    /// Older chunk rows of each written file that the new records do not
    /// cover are removed in the same transaction.
    async fn upsert_records(&self, records: &[NewEmbeddingRecord]) -> Result<usize>;

    /// Swap every record of the resource for `records` atomically. On error
    /// the previous records are left in place.
    async fn replace_records_for_resource(
        &self,
        resource_id: &str,
        records: &[NewEmbeddingRecord],
    ) -> Result<usize>;

    async fn delete_records_for_resource(&self, resource_id: &str) -> Result<u64>;

    /// All records of a resource, ordered by path, then branch, then id.
    async fn records_for_resource(&self, resource_id: &str) -> Result<Vec<EmbeddingRecord>>;

    /// Top `limit` records of the resource by cosine similarity to `query`.
    /// Equal scores are ordered by path.
    async fn nearest_neighbours(
        &self,
        resource_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(EmbeddingRecord, f32)>>;

    async fn count_records(&self) -> Result<u64>;
}

/// Cosine similarity of two vectors; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
