//! Point-in-time snapshot of the service, for the `status` command and
//! health endpoints of embedding hosts.

use crate::storage::{ClaimStats, ClaimStore, EmbeddingStore, JobStats, JobStore};
use anyhow::Result;
use prism_ai_embed::{CircuitBreaker, CircuitSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Process identity written to claim rows
    pub instance_id: String,
    pub claims: ClaimStats,
    pub jobs: JobStats,
    /// Stored embedding records across all resources
    pub total_records: u64,
    /// Absent when no provider was configured for this process
    pub circuit: Option<CircuitSnapshot>,
    /// Unix timestamp (seconds)
    pub generated_at: i64,
}

impl ServiceStatus {
    /// Collects a snapshot. `store` usually is a single
    /// [`SqliteStore`](crate::storage::sqlite_store::SqliteStore).
    pub async fn collect<S>(
        instance_id: &str,
        store: &S,
        circuit: Option<&CircuitBreaker>,
    ) -> Result<Self>
    where
        S: ClaimStore + JobStore + EmbeddingStore,
    {
        Ok(Self {
            instance_id: instance_id.to_string(),
            claims: store.claim_stats().await?,
            jobs: store.job_stats().await?,
            total_records: store.count_records().await?,
            circuit: circuit.map(CircuitBreaker::snapshot),
            generated_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Unfinished jobs or claims exist.
    pub fn is_busy(&self) -> bool {
        self.jobs.pending + self.jobs.processing + self.jobs.retrying > 0
            || self.claims.active > 0
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Instance: {}", self.instance_id)?;
        writeln!(
            f,
            "Claims:   {} active, {} completed, {} failed ({} total)",
            self.claims.active, self.claims.completed, self.claims.failed, self.claims.total
        )?;
        writeln!(
            f,
            "Jobs:     {} pending, {} processing, {} retrying, {} completed, {} failed ({} total)",
            self.jobs.pending,
            self.jobs.processing,
            self.jobs.retrying,
            self.jobs.completed,
            self.jobs.failed,
            self.jobs.total
        )?;
        writeln!(f, "Records:  {}", self.total_records)?;
        match &self.circuit {
            Some(circuit) => {
                write!(
                    f,
                    "Circuit:  {} ({}/{} consecutive failures",
                    circuit.state, circuit.consecutive_failures, circuit.failure_threshold
                )?;
                if let Some(ms) = circuit.reopens_in_ms {
                    write!(f, ", probe in {ms} ms")?;
                }
                writeln!(f, ")")
            }
            None => writeln!(f, "Circuit:  not configured"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobQueue, QueueConfig};
    use crate::storage::sqlite_store::SqliteStore;
    use prism_ai_embed::CircuitConfig;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_collect_and_render() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = Arc::new(SqliteStore::open(&dir.path().join("status.db")).await?);
        JobQueue::new(store.clone(), QueueConfig::default())
            .enqueue("42", "/repo", "c1", 0, false)
            .await?;
        let circuit = CircuitBreaker::new(CircuitConfig::default());

        let status = ServiceStatus::collect("host-1", store.as_ref(), Some(&circuit)).await?;
        assert_eq!(status.jobs.pending, 1);
        assert_eq!(status.total_records, 0);
        assert!(status.is_busy());

        let text = status.to_string();
        assert!(text.contains("Instance: host-1"));
        assert!(text.contains("1 pending"));
        assert!(text.contains("Circuit:  closed"));

        let json = serde_json::to_value(&status)?;
        assert_eq!(json["jobs"]["pending"], 1);
        assert_eq!(json["circuit"]["state"], "closed");
        Ok(())
    }
}
