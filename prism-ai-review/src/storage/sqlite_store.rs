//! SQLite implementation of the storage traits
//!
//! ## Database Schema
//!
//! ```sql
//! -- One row per claim attempt that won; at most one ACTIVE row per fingerprint
//! CREATE TABLE processing_claims (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     fingerprint TEXT NOT NULL,          -- blake3 hex of kind|resource|discriminator
//!     event_kind TEXT NOT NULL,
//!     resource_id TEXT NOT NULL,
//!     status TEXT NOT NULL,               -- ACTIVE | COMPLETED | FAILED
//!     owner_instance_id TEXT NOT NULL,
//!     started_at INTEGER NOT NULL,        -- Unix milliseconds
//!     completed_at INTEGER,
//!     error_message TEXT
//! );
//! CREATE UNIQUE INDEX idx_claims_active_fingerprint
//!     ON processing_claims(fingerprint) WHERE status = 'ACTIVE';
//!
//! CREATE TABLE embedding_jobs (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     resource_id TEXT NOT NULL,
//!     source_location TEXT NOT NULL,
//!     correlation_id TEXT NOT NULL,
//!     priority INTEGER NOT NULL,
//!     status TEXT NOT NULL,               -- PENDING | PROCESSING | RETRYING | COMPLETED | FAILED
//!     attempts INTEGER NOT NULL,
//!     max_attempts INTEGER NOT NULL,
//!     is_reembedding INTEGER NOT NULL,
//!     created_at INTEGER NOT NULL,
//!     updated_at INTEGER NOT NULL,
//!     available_at INTEGER NOT NULL,      -- earliest dequeue time for RETRYING jobs
//!     last_error TEXT
//! );
//!
//! CREATE TABLE embedding_records (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     resource_id TEXT NOT NULL,
//!     file_path TEXT NOT NULL,
//!     content TEXT NOT NULL,
//!     vector BLOB NOT NULL,               -- little-endian f16 values
//!     dimension INTEGER NOT NULL,
//!     language TEXT NOT NULL,
//!     revision_id TEXT NOT NULL,
//!     branch TEXT NOT NULL,
//!     created_at INTEGER NOT NULL,
//!     updated_at INTEGER NOT NULL,
//!     UNIQUE(resource_id, file_path, branch)
//! );
//! ```
//!
//! ## SQLite Settings
//!
//! - **WAL mode**: readers do not block the single writer
//! - **Busy timeout**: competing writers from other processes wait instead of failing
//! - **Single-statement transitions**: claims and dequeues never read-then-write

use super::{
    ClaimId, ClaimStats, ClaimStatus, ClaimStore, EmbeddingJob, EmbeddingRecord, EmbeddingStore,
    JobId, JobStats, JobStatus, JobStore, NewClaim, NewEmbeddingRecord, NewJob, ProcessingClaim,
    cosine_similarity,
};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use half::f16;
use prism_ai_context::strip_chunk_suffix;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default database file name, relative to the working directory.
pub const DEFAULT_DB_FILE: &str = ".prism-ai.db";

/// SQLite-backed store implementing [`ClaimStore`], [`JobStore`] and [`EmbeddingStore`].
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) a database file with default connection settings.
    pub async fn open(db_path: &Path) -> Result<Self> {
        Self::connect(db_path, Duration::from_secs(5), 8).await
    }

    /// Opens a database file with an explicit busy timeout and pool size.
    pub async fn connect(
        db_path: &Path,
        busy_timeout: Duration,
        max_connections: u32,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(busy_timeout)
                    .create_if_missing(true),
            )
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;

        tracing::debug!("Opened SQLite store at {}", db_path.display());
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, creating tables if they do not exist.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection. Later operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processing_claims (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL,
                event_kind TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('ACTIVE', 'COMPLETED', 'FAILED')),
                owner_instance_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                error_message TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id TEXT NOT NULL,
                source_location TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL CHECK (
                    status IN ('PENDING', 'PROCESSING', 'RETRYING', 'COMPLETED', 'FAILED')
                ),
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                is_reembedding INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                last_error TEXT,
                CHECK (attempts <= max_attempts)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                content TEXT NOT NULL,
                vector BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                language TEXT NOT NULL,
                revision_id TEXT NOT NULL,
                branch TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CONSTRAINT unique_record UNIQUE(resource_id, file_path, branch)
            )
            "#,
        )
        .execute(pool)
        .await?;

        for statement in [
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_active_fingerprint \
             ON processing_claims(fingerprint) WHERE status = 'ACTIVE'",
            "CREATE INDEX IF NOT EXISTS idx_claims_status_started \
             ON processing_claims(status, started_at)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_dequeue \
             ON embedding_jobs(status, priority DESC, created_at, id)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_correlation ON embedding_jobs(correlation_id)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_resource ON embedding_jobs(resource_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_records_resource \
             ON embedding_records(resource_id, file_path)",
        ] {
            sqlx::query(statement).execute(pool).await?;
        }

        Ok(())
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Encodes a vector as little-endian half-precision values.
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let words: Vec<u16> = vector
        .iter()
        .map(|v| f16::from_f32(*v).to_bits().to_le())
        .collect();
    bytemuck::cast_slice::<u16, u8>(&words).to_vec()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        bail!("vector blob has odd length {}", bytes.len());
    }
    // Copy into a u16 buffer; the blob itself carries no alignment guarantee
    let mut words = vec![0u16; bytes.len() / 2];
    bytemuck::cast_slice_mut::<u16, u8>(&mut words).copy_from_slice(bytes);
    Ok(words
        .into_iter()
        .map(|w| f16::from_bits(u16::from_le(w)).to_f32())
        .collect())
}

async fn write_record(
    conn: &mut SqliteConnection,
    record: &NewEmbeddingRecord,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO embedding_records
            (resource_id, file_path, content, vector, dimension, language,
             revision_id, branch, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        ON CONFLICT(resource_id, file_path, branch) DO UPDATE SET
            content = excluded.content,
            vector = excluded.vector,
            dimension = excluded.dimension,
            language = excluded.language,
            revision_id = excluded.revision_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.resource_id)
    .bind(&record.file_path)
    .bind(&record.content)
    .bind(encode_vector(&record.vector))
    .bind(record.vector.len() as i64)
    .bind(&record.language)
    .bind(&record.revision_id)
    .bind(&record.branch)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Deletes rows of the files being written whose keys the new records no
/// longer produce, such as `a.rs#chunk2` after `a.rs` shrank to one chunk, or
/// the unchunked `a.rs` after it grew into chunks.
async fn delete_superseded_chunks(
    conn: &mut SqliteConnection,
    records: &[NewEmbeddingRecord],
) -> Result<u64> {
    let written: HashSet<(&str, &str, &str)> = records
        .iter()
        .map(|r| (r.resource_id.as_str(), r.file_path.as_str(), r.branch.as_str()))
        .collect();
    let sources: BTreeSet<(&str, &str, &str)> = records
        .iter()
        .map(|r| {
            (
                r.resource_id.as_str(),
                strip_chunk_suffix(&r.file_path),
                r.branch.as_str(),
            )
        })
        .collect();

    let mut removed = 0;
    for (resource_id, source, branch) in sources {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, file_path FROM embedding_records
            WHERE resource_id = ?1 AND branch = ?2
              AND (file_path = ?3 OR substr(file_path, 1, length(?3) + 6) = ?3 || '#chunk')
            "#,
        )
        .bind(resource_id)
        .bind(branch)
        .bind(source)
        .fetch_all(&mut *conn)
        .await?;

        for (id, file_path) in rows {
            if strip_chunk_suffix(&file_path) != source
                || written.contains(&(resource_id, file_path.as_str(), branch))
            {
                continue;
            }
            removed += sqlx::query("DELETE FROM embedding_records WHERE id = ?1")
                .bind(id)
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }
    }
    Ok(removed)
}

fn claim_from_row(row: &SqliteRow) -> Result<ProcessingClaim> {
    let status: String = row.try_get("status")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;
    Ok(ProcessingClaim {
        id: row.try_get("id")?,
        fingerprint: row.try_get("fingerprint")?,
        event_kind: row.try_get("event_kind")?,
        resource_id: row.try_get("resource_id")?,
        status: status.parse()?,
        owner_instance_id: row.try_get("owner_instance_id")?,
        started_at: from_millis(row.try_get("started_at")?),
        completed_at: completed_at.map(from_millis),
        error_message: row.try_get("error_message")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<EmbeddingJob> {
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    Ok(EmbeddingJob {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        source_location: row.try_get("source_location")?,
        correlation_id: row.try_get("correlation_id")?,
        priority: row.try_get("priority")?,
        status: status.parse()?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        is_reembedding: row.try_get("is_reembedding")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        available_at: from_millis(row.try_get("available_at")?),
        last_error: row.try_get("last_error")?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<EmbeddingRecord> {
    let vector: Vec<u8> = row.try_get("vector")?;
    Ok(EmbeddingRecord {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        file_path: row.try_get("file_path")?,
        content: row.try_get("content")?,
        vector: decode_vector(&vector)?,
        language: row.try_get("language")?,
        revision_id: row.try_get("revision_id")?,
        branch: row.try_get("branch")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

#[async_trait]
impl ClaimStore for SqliteStore {
    async fn try_insert_claim(&self, claim: &NewClaim) -> Result<Option<ProcessingClaim>> {
        // The partial unique index turns a second ACTIVE row into an ignored insert
        let row = sqlx::query(
            r#"
            INSERT OR IGNORE INTO processing_claims
                (fingerprint, event_kind, resource_id, status, owner_instance_id, started_at)
            VALUES (?1, ?2, ?3, 'ACTIVE', ?4, ?5)
            RETURNING *
            "#,
        )
        .bind(&claim.fingerprint)
        .bind(&claim.event_kind)
        .bind(&claim.resource_id)
        .bind(&claim.owner_instance_id)
        .bind(to_millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(claim_from_row).transpose()
    }

    async fn get_claim(&self, id: ClaimId) -> Result<Option<ProcessingClaim>> {
        let row = sqlx::query("SELECT * FROM processing_claims WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn find_active_claim(&self, fingerprint: &str) -> Result<Option<ProcessingClaim>> {
        let row = sqlx::query(
            "SELECT * FROM processing_claims WHERE fingerprint = ?1 AND status = 'ACTIVE'",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn finish_claim(
        &self,
        id: ClaimId,
        status: ClaimStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if status == ClaimStatus::Active {
            bail!("cannot finish a claim as ACTIVE");
        }
        let result = sqlx::query(
            r#"
            UPDATE processing_claims
            SET status = ?1, completed_at = ?2, error_message = ?3
            WHERE id = ?4 AND status = 'ACTIVE'
            "#,
        )
        .bind(status.as_str())
        .bind(to_millis(Utc::now()))
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_stale_claims(&self, started_before: DateTime<Utc>, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE processing_claims
            SET status = 'FAILED', completed_at = ?1, error_message = ?2
            WHERE status = 'ACTIVE' AND started_at < ?3
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(message)
        .bind(to_millis(started_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_stats(&self) -> Result<ClaimStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM processing_claims GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = ClaimStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let count = count as u64;
            match status.parse::<ClaimStatus>()? {
                ClaimStatus::Active => stats.active = count,
                ClaimStatus::Completed => stats.completed = count,
                ClaimStatus::Failed => stats.failed = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &NewJob) -> Result<EmbeddingJob> {
        let now = to_millis(Utc::now());
        let row = sqlx::query(
            r#"
            INSERT INTO embedding_jobs
                (resource_id, source_location, correlation_id, priority, status, attempts,
                 max_attempts, is_reembedding, created_at, updated_at, available_at)
            VALUES (?1, ?2, ?3, ?4, 'PENDING', 0, ?5, ?6, ?7, ?7, ?7)
            RETURNING *
            "#,
        )
        .bind(&job.resource_id)
        .bind(&job.source_location)
        .bind(&job.correlation_id)
        .bind(job.priority)
        .bind(i64::from(job.max_attempts))
        .bind(job.is_reembedding)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        job_from_row(&row)
    }

    async fn dequeue_next_job(&self, now: DateTime<Utc>) -> Result<Option<EmbeddingJob>> {
        let row = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'PROCESSING', attempts = attempts + 1, updated_at = ?1
            WHERE id = (
                SELECT id FROM embedding_jobs
                WHERE status IN ('PENDING', 'RETRYING')
                  AND available_at <= ?1
                  AND attempts < max_attempts
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            AND status IN ('PENDING', 'RETRYING')
            RETURNING *
            "#,
        )
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_job(&self, id: JobId) -> Result<Option<EmbeddingJob>> {
        let row = sqlx::query("SELECT * FROM embedding_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_job_by_correlation(&self, correlation_id: &str) -> Result<Option<EmbeddingJob>> {
        let row = sqlx::query(
            "SELECT * FROM embedding_jobs WHERE correlation_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_job_completed(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs SET status = 'COMPLETED', updated_at = ?1
            WHERE id = ?2 AND status = 'PROCESSING'
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_job_retrying(
        &self,
        id: JobId,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'RETRYING', updated_at = ?1, available_at = ?2, last_error = ?3
            WHERE id = ?4 AND status = 'PROCESSING' AND attempts < max_attempts
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(to_millis(available_at))
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_job_failed(&self, id: JobId, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs SET status = 'FAILED', updated_at = ?1, last_error = ?2
            WHERE id = ?3 AND status = 'PROCESSING'
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch_job(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE embedding_jobs SET updated_at = ?1 WHERE id = ?2 AND status = 'PROCESSING'",
        )
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_stale_jobs(&self, updated_before: DateTime<Utc>) -> Result<u64> {
        let now = to_millis(Utc::now());
        let cutoff = to_millis(updated_before);
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'FAILED', updated_at = ?1,
                last_error = 'worker lease expired with no attempts left'
            WHERE status = 'PROCESSING' AND updated_at < ?2 AND attempts >= max_attempts
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'RETRYING', updated_at = ?1, available_at = ?1,
                last_error = 'worker lease expired'
            WHERE status = 'PROCESSING' AND updated_at < ?2
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(failed + requeued)
    }

    async fn job_stats(&self) -> Result<JobStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM embedding_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let count = count as u64;
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::Retrying => stats.retrying = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    async fn recent_jobs(&self, limit: u32, offset: u32) -> Result<Vec<EmbeddingJob>> {
        let rows = sqlx::query(
            "SELECT * FROM embedding_jobs ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn has_active_job(&self, resource_id: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM embedding_jobs
                WHERE resource_id = ?1 AND status IN ('PENDING', 'PROCESSING', 'RETRYING')
            )
            "#,
        )
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }
}

#[async_trait]
impl EmbeddingStore for SqliteStore {
    async fn upsert_records(&self, records: &[NewEmbeddingRecord]) -> Result<usize> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        let superseded = delete_superseded_chunks(&mut tx, records).await?;
        if superseded > 0 {
            tracing::debug!("Removed {} superseded chunk records", superseded);
        }
        for record in records {
            write_record(&mut tx, record, now).await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn replace_records_for_resource(
        &self,
        resource_id: &str,
        records: &[NewEmbeddingRecord],
    ) -> Result<usize> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM embedding_records WHERE resource_id = ?1")
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        for record in records {
            if record.resource_id != resource_id {
                bail!(
                    "record for {} cannot replace records of resource {}",
                    record.resource_id,
                    resource_id
                );
            }
            write_record(&mut tx, record, now).await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn delete_records_for_resource(&self, resource_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embedding_records WHERE resource_id = ?1")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn records_for_resource(&self, resource_id: &str) -> Result<Vec<EmbeddingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM embedding_records
            WHERE resource_id = ?1
            ORDER BY file_path, branch, id
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn nearest_neighbours(
        &self,
        resource_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(EmbeddingRecord, f32)>> {
        let records = self.records_for_resource(resource_id).await?;

        let mut scored: Vec<(EmbeddingRecord, f32)> = records
            .into_iter()
            .filter(|record| record.vector.len() == query.len())
            .map(|record| {
                let score = cosine_similarity(query, &record.vector);
                (record, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.file_path.cmp(&b.0.file_path))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count_records(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    async fn test_store() -> Result<(TempDir, SqliteStore)> {
        let dir = tempdir()?;
        let store = SqliteStore::open(&dir.path().join("test.db")).await?;
        Ok((dir, store))
    }

    fn new_claim(fingerprint: &str) -> NewClaim {
        NewClaim {
            fingerprint: fingerprint.to_string(),
            event_kind: "push".to_string(),
            resource_id: "42".to_string(),
            owner_instance_id: "instance-a".to_string(),
        }
    }

    fn new_job(priority: i64) -> NewJob {
        NewJob {
            resource_id: "42".to_string(),
            source_location: "/tmp/repo".to_string(),
            correlation_id: format!("corr-{priority}"),
            priority,
            max_attempts: 3,
            is_reembedding: false,
        }
    }

    fn record(path: &str, vector: Vec<f32>) -> NewEmbeddingRecord {
        NewEmbeddingRecord {
            resource_id: "42".to_string(),
            file_path: path.to_string(),
            content: format!("content of {path}"),
            vector,
            language: "rust".to_string(),
            revision_id: "abc123".to_string(),
            branch: "main".to_string(),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_while_active() -> Result<()> {
        let (_dir, store) = test_store().await?;

        let first = store.try_insert_claim(&new_claim("fp")).await?;
        let first = first.expect("first claim should be inserted");
        assert_eq!(first.status, ClaimStatus::Active);
        assert!(store.try_insert_claim(&new_claim("fp")).await?.is_none());
        assert!(store.try_insert_claim(&new_claim("other")).await?.is_some());

        assert!(store.finish_claim(first.id, ClaimStatus::Completed, None).await?);
        // Already terminal
        assert!(!store.finish_claim(first.id, ClaimStatus::Failed, Some("late")).await?);

        // Fingerprint is free again
        assert!(store.try_insert_claim(&new_claim("fp")).await?.is_some());

        let stats = store.claim_stats().await?;
        assert_eq!(stats.active, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_stale_claims() -> Result<()> {
        let (_dir, store) = test_store().await?;
        let claim = store.try_insert_claim(&new_claim("fp")).await?.unwrap();

        let reaped = store
            .fail_stale_claims(Utc::now() - chrono::Duration::hours(1), "stale")
            .await?;
        assert_eq!(reaped, 0);

        let reaped = store
            .fail_stale_claims(Utc::now() + chrono::Duration::seconds(1), "stale claim")
            .await?;
        assert_eq!(reaped, 1);

        let claim = store.get_claim(claim.id).await?.unwrap();
        assert_eq!(claim.status, ClaimStatus::Failed);
        assert_eq!(claim.error_message.as_deref(), Some("stale claim"));
        assert!(claim.completed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_dequeue_follows_priority_then_age() -> Result<()> {
        let (_dir, store) = test_store().await?;
        let mut ids = Vec::new();
        for priority in [1, 5, 5, 3] {
            ids.push(store.insert_job(&new_job(priority)).await?.id);
        }

        let mut order = Vec::new();
        while let Some(job) = store.dequeue_next_job(Utc::now()).await? {
            assert_eq!(job.status, JobStatus::Processing);
            assert_eq!(job.attempts, 1);
            order.push(job.id);
        }
        assert_eq!(order, vec![ids[1], ids[2], ids[3], ids[0]]);
        Ok(())
    }

    #[tokio::test]
    async fn test_retrying_job_waits_until_available() -> Result<()> {
        let (_dir, store) = test_store().await?;
        store.insert_job(&new_job(1)).await?;
        let job = store.dequeue_next_job(Utc::now()).await?.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(60);
        assert!(store.mark_job_retrying(job.id, later, "provider down").await?);
        assert!(store.dequeue_next_job(Utc::now()).await?.is_none());

        let again = store.dequeue_next_job(later).await?.unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
        assert_eq!(again.last_error.as_deref(), Some("provider down"));
        Ok(())
    }

    #[tokio::test]
    async fn test_transitions_require_processing() -> Result<()> {
        let (_dir, store) = test_store().await?;
        let job = store.insert_job(&new_job(1)).await?;
        assert!(!store.mark_job_completed(job.id).await?);

        store.dequeue_next_job(Utc::now()).await?;
        assert!(store.mark_job_completed(job.id).await?);
        assert!(!store.mark_job_failed(job.id, "too late").await?);

        let stored = store.find_job_by_correlation("corr-1").await?.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(!store.has_active_job("42").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_requeue_stale_jobs() -> Result<()> {
        let (_dir, store) = test_store().await?;
        let mut one_shot = new_job(2);
        one_shot.max_attempts = 1;
        let exhausted = store.insert_job(&one_shot).await?;
        let retryable = store.insert_job(&new_job(1)).await?;
        store.dequeue_next_job(Utc::now()).await?;
        store.dequeue_next_job(Utc::now()).await?;

        let released = store
            .requeue_stale_jobs(Utc::now() + chrono::Duration::seconds(1))
            .await?;
        assert_eq!(released, 2);

        let exhausted = store.get_job(exhausted.id).await?.unwrap();
        assert_eq!(exhausted.status, JobStatus::Failed);
        let retryable = store.get_job(retryable.id).await?.unwrap();
        assert_eq!(retryable.status, JobStatus::Retrying);

        let stats = store.job_stats().await?;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retrying, 1);
        assert_eq!(stats.total, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_recent_jobs_newest_first() -> Result<()> {
        let (_dir, store) = test_store().await?;
        for priority in 0..5 {
            store.insert_job(&new_job(priority)).await?;
        }
        let page = store.recent_jobs(2, 1).await?;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].priority, 3);
        assert_eq!(page[1].priority, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_upsert_replaces_key() -> Result<()> {
        let (_dir, store) = test_store().await?;
        store
            .upsert_records(&[record("src/a.rs", vec![1.0, 0.0]), record("src/b.rs", vec![0.0, 1.0])])
            .await?;

        let mut newer = record("src/a.rs", vec![0.5, 0.5]);
        newer.revision_id = "def456".to_string();
        store.upsert_records(&[newer]).await?;

        let records = store.records_for_resource("42").await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file_path, "src/a.rs");
        assert_eq!(records[0].revision_id, "def456");
        assert_eq!(records[0].vector, vec![0.5, 0.5]);
        assert_eq!(store.count_records().await?, 2);

        assert_eq!(store.delete_records_for_resource("42").await?, 2);
        assert!(store.records_for_resource("42").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_nearest_neighbours_ranked_by_similarity() -> Result<()> {
        let (_dir, store) = test_store().await?;
        store
            .upsert_records(&[
                record("far.rs", vec![0.0, 1.0]),
                record("near.rs", vec![1.0, 0.1]),
                record("also_near.rs", vec![1.0, 0.1]),
                record("wrong_dim.rs", vec![1.0, 0.0, 0.0]),
            ])
            .await?;

        let results = store.nearest_neighbours("42", &[1.0, 0.0], 2).await?;
        let paths: Vec<_> = results.iter().map(|(r, _)| r.file_path.as_str()).collect();
        assert_eq!(paths, vec!["also_near.rs", "near.rs"]);
        assert!(results[0].1 > 0.9);

        assert!(store.nearest_neighbours("other", &[1.0, 0.0], 5).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_two_handles_share_claims() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("shared.db");
        let a = SqliteStore::open(&path).await?;
        let b = SqliteStore::open(&path).await?;

        assert!(a.try_insert_claim(&new_claim("fp")).await?.is_some());
        assert!(b.try_insert_claim(&new_claim("fp")).await?.is_none());
        assert!(b.find_active_claim("fp").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_touch_job_refreshes_lease() -> Result<()> {
        let (_dir, store) = test_store().await?;
        let job = store.insert_job(&new_job(1)).await?;
        assert!(!store.touch_job(job.id).await?);

        store.dequeue_next_job(Utc::now()).await?;
        let before_touch = Utc::now() + chrono::Duration::milliseconds(5);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.touch_job(job.id).await?);

        // Updated after the cutoff, so the lease is still held
        assert_eq!(store.requeue_stale_jobs(before_touch).await?, 0);
        assert_eq!(
            store.get_job(job.id).await?.unwrap().status,
            JobStatus::Processing
        );

        assert!(store.mark_job_completed(job.id).await?);
        assert!(!store.touch_job(job.id).await?);
        Ok(())
    }

    fn revision(path: &str, rev: &str) -> NewEmbeddingRecord {
        let mut record = record(path, vec![1.0, 0.0]);
        record.revision_id = rev.to_string();
        record
    }

    fn keys(records: &[EmbeddingRecord]) -> Vec<(&str, &str)> {
        records
            .iter()
            .map(|r| (r.file_path.as_str(), r.revision_id.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn test_shrunk_file_drops_old_chunks() -> Result<()> {
        let (_dir, store) = test_store().await?;
        store
            .upsert_records(&[
                revision("src/a.rs#chunk0", "rev1"),
                revision("src/a.rs#chunk1", "rev1"),
                revision("src/a.rs#chunk2", "rev1"),
                revision("src/a.rs.bak", "rev1"),
                revision("src/b.rs", "rev1"),
            ])
            .await?;

        store.upsert_records(&[revision("src/a.rs", "rev2")]).await?;

        let records = store.records_for_resource("42").await?;
        assert_eq!(
            keys(&records),
            vec![
                ("src/a.rs", "rev2"),
                ("src/a.rs.bak", "rev1"),
                ("src/b.rs", "rev1"),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_grown_file_drops_unchunked_row() -> Result<()> {
        let (_dir, store) = test_store().await?;
        store
            .upsert_records(&[revision("src/a.rs", "rev1")])
            .await?;
        let mut other_branch = revision("src/a.rs", "rev1");
        other_branch.branch = "dev".to_string();
        store.upsert_records(&[other_branch]).await?;

        store
            .upsert_records(&[
                revision("src/a.rs#chunk0", "rev2"),
                revision("src/a.rs#chunk1", "rev2"),
                revision("src/a.rs#chunk2", "rev2"),
            ])
            .await?;
        // Shrinks again, still chunked
        store
            .upsert_records(&[
                revision("src/a.rs#chunk0", "rev3"),
                revision("src/a.rs#chunk1", "rev3"),
            ])
            .await?;

        let records = store.records_for_resource("42").await?;
        let main: Vec<_> = records.iter().filter(|r| r.branch == "main").cloned().collect();
        assert_eq!(
            keys(&main),
            vec![("src/a.rs#chunk0", "rev3"), ("src/a.rs#chunk1", "rev3")]
        );
        // Other branches keep their own rows
        assert_eq!(records.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_replace_records_for_resource() -> Result<()> {
        let (_dir, store) = test_store().await?;
        store
            .upsert_records(&[revision("src/a.rs", "rev1"), revision("src/old.rs", "rev1")])
            .await?;
        let mut elsewhere = revision("src/a.rs", "rev1");
        elsewhere.resource_id = "7".to_string();
        store.upsert_records(&[elsewhere.clone()]).await?;

        let stored = store
            .replace_records_for_resource("42", &[revision("src/a.rs", "rev2")])
            .await?;
        assert_eq!(stored, 1);
        assert_eq!(
            keys(&store.records_for_resource("42").await?),
            vec![("src/a.rs", "rev2")]
        );
        assert_eq!(store.records_for_resource("7").await?.len(), 1);

        // A rejected write rolls back the delete too
        assert!(
            store
                .replace_records_for_resource("42", &[revision("src/b.rs", "rev3"), elsewhere])
                .await
                .is_err()
        );
        assert_eq!(
            keys(&store.records_for_resource("42").await?),
            vec![("src/a.rs", "rev2")]
        );
        Ok(())
    }

    #[test]
    fn test_vector_blob_encoding() {
        let vector = vec![0.25, -1.5, 3.0];
        let bytes = encode_vector(&vector);
        assert_eq!(bytes.len(), 6);
        assert_eq!(decode_vector(&bytes).unwrap(), vector);
        assert!(decode_vector(&bytes[..5]).is_err());
    }

    #[test]
    fn test_vector_blob_is_little_endian() {
        // 1.0 is 0x3C00 and -2.0 is 0xC000 in half precision
        assert_eq!(encode_vector(&[1.0, -2.0]), vec![0x00, 0x3C, 0x00, 0xC0]);
        assert_eq!(decode_vector(&[0x00, 0x3C]).unwrap(), vec![1.0]);
    }
}
