//! Claim-based deduplication of inbound events.

use super::{InboundEvent, IntakeError, Result};
use crate::storage::{ClaimId, ClaimStats, ClaimStatus, ClaimStore, NewClaim};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Message written to claims failed by the reaper.
pub const STALE_CLAIM_MESSAGE: &str = "stale claim: processing exceeded the maximum duration";

/// Settings for the intake guard and its reaper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Identifies this process in claim rows
    pub instance_id: String,
    /// How often the reaper sweeps for stale claims
    pub reaper_interval_secs: u64,
    /// ACTIVE claims older than this are force-failed
    pub max_processing_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            reaper_interval_secs: 5 * 60,
            max_processing_secs: 30 * 60,
        }
    }
}

impl IntakeConfig {
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_max_processing_secs(mut self, secs: u64) -> Self {
        self.max_processing_secs = secs;
        self
    }

    pub fn with_reaper_interval_secs(mut self, secs: u64) -> Self {
        self.reaper_interval_secs = secs;
        self
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn max_processing(&self) -> Duration {
        Duration::from_secs(self.max_processing_secs)
    }
}

/// `<host>-<pid>`, falling back to `local` when the host name is unknown.
pub fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "local".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimOutcome {
    /// This caller owns the event and should process it
    pub accepted: bool,
    /// Id of the new claim when accepted, of the holding claim otherwise
    pub claim_id: Option<ClaimId>,
    /// Another ACTIVE claim already holds the fingerprint
    pub is_duplicate: bool,
    pub fingerprint: String,
}

/// Ensures each event is processed at most once across all instances sharing a store.
pub struct IntakeGuard {
    store: Arc<dyn ClaimStore>,
    config: IntakeConfig,
}

impl IntakeGuard {
    pub fn new(store: Arc<dyn ClaimStore>, config: IntakeConfig) -> Self {
        Self { store, config }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    /// Attempts to claim `event` for this instance.
    ///
    /// Exactly one of any number of concurrent attempts for the same event is
    /// accepted; the rest see `is_duplicate = true`. Store failures are errors,
    /// never duplicates.
    pub async fn claim(&self, event: &InboundEvent) -> Result<ClaimOutcome> {
        let (Some(fingerprint), Some(resource_id)) = (event.fingerprint(), event.resource_id())
        else {
            warn!("Refusing to claim unrecognized event kind '{}'", event.kind());
            return Err(IntakeError::UnrecognizedEvent {
                kind: event.kind().to_string(),
            });
        };

        let new_claim = NewClaim {
            fingerprint: fingerprint.clone(),
            event_kind: event.kind().to_string(),
            resource_id: resource_id.to_string(),
            owner_instance_id: self.config.instance_id.clone(),
        };

        let inserted = self.store.try_insert_claim(&new_claim).await.map_err(|e| {
            error!("Claim store failed while claiming {}: {:#}", fingerprint, e);
            IntakeError::ClaimStoreUnavailable { source: e }
        })?;

        match inserted {
            Some(claim) => {
                info!(
                    "Claimed {} event for resource {} (claim {}, fingerprint {})",
                    claim.event_kind, claim.resource_id, claim.id, claim.fingerprint
                );
                Ok(ClaimOutcome {
                    accepted: true,
                    claim_id: Some(claim.id),
                    is_duplicate: false,
                    fingerprint,
                })
            }
            None => {
                // The holder may finish between the insert and this read
                let holder = self.store.find_active_claim(&fingerprint).await?;
                debug!(
                    "Duplicate {} event for resource {} (held by {})",
                    event.kind(),
                    resource_id,
                    holder
                        .as_ref()
                        .map(|c| c.owner_instance_id.as_str())
                        .unwrap_or("a finished claim")
                );
                Ok(ClaimOutcome {
                    accepted: false,
                    claim_id: holder.map(|c| c.id),
                    is_duplicate: true,
                    fingerprint,
                })
            }
        }
    }

    /// Marks an ACTIVE claim completed. Returns false if it was no longer ACTIVE.
    pub async fn complete(&self, claim_id: ClaimId) -> Result<bool> {
        let done = self
            .store
            .finish_claim(claim_id, ClaimStatus::Completed, None)
            .await?;
        if done {
            debug!("Claim {} completed", claim_id);
        } else {
            warn!("Claim {} was not active when completing", claim_id);
        }
        Ok(done)
    }

    /// Marks an ACTIVE claim failed with `reason`. Returns false if it was no longer ACTIVE.
    pub async fn fail(&self, claim_id: ClaimId, reason: &str) -> Result<bool> {
        let done = self
            .store
            .finish_claim(claim_id, ClaimStatus::Failed, Some(reason))
            .await?;
        if done {
            warn!("Claim {} failed: {}", claim_id, reason);
        } else {
            warn!("Claim {} was not active when failing", claim_id);
        }
        Ok(done)
    }

    pub async fn stats(&self) -> Result<ClaimStats> {
        Ok(self.store.claim_stats().await?)
    }

    /// Force-fails ACTIVE claims older than the configured maximum, freeing
    /// their fingerprints.
    pub async fn reap_stale(&self) -> Result<u64> {
        let max_processing = chrono::Duration::from_std(self.config.max_processing())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - max_processing;
        let reaped = self
            .store
            .fail_stale_claims(cutoff, STALE_CLAIM_MESSAGE)
            .await?;
        if reaped > 0 {
            warn!("Reaped {} stale claims", reaped);
        }
        Ok(reaped)
    }

    /// Runs [`reap_stale`](Self::reap_stale) on an interval until `shutdown`
    /// turns true or its sender is dropped.
    pub fn spawn_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.reaper_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                "Claim reaper started (every {:?}, max processing {:?})",
                self.config.reaper_interval(),
                self.config.max_processing()
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.reap_stale().await {
                            error!("Claim reaper sweep failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Claim reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite_store::SqliteStore;
    use tempfile::{TempDir, tempdir};
    use tracing_test::traced_test;

    async fn guard_with(config: IntakeConfig) -> anyhow::Result<(TempDir, SqliteStore, IntakeGuard)> {
        let dir = tempdir()?;
        let store = SqliteStore::open(&dir.path().join("intake.db")).await?;
        let guard = IntakeGuard::new(Arc::new(store.clone()), config);
        Ok((dir, store, guard))
    }

    fn push_event() -> InboundEvent {
        InboundEvent::Push {
            resource_id: "42".into(),
            revision: "abc123".into(),
            git_ref: "refs/heads/main".into(),
        }
    }

    #[tokio::test]
    async fn test_second_claim_is_duplicate_until_completed() -> anyhow::Result<()> {
        let (_dir, _store, guard) = guard_with(IntakeConfig::default()).await?;

        let first = guard.claim(&push_event()).await?;
        assert!(first.accepted);
        assert!(!first.is_duplicate);

        let second = guard.claim(&push_event()).await?;
        assert!(!second.accepted);
        assert!(second.is_duplicate);
        assert_eq!(second.claim_id, first.claim_id);
        assert_eq!(second.fingerprint, first.fingerprint);

        assert!(guard.complete(first.claim_id.unwrap()).await?);
        assert!(!guard.complete(first.claim_id.unwrap()).await?);

        let third = guard.claim(&push_event()).await?;
        assert!(third.accepted);

        let stats = guard.stats().await?;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_records_reason() -> anyhow::Result<()> {
        let (_dir, store, guard) = guard_with(IntakeConfig::default()).await?;
        let outcome = guard.claim(&push_event()).await?;
        let id = outcome.claim_id.unwrap();

        assert!(guard.fail(id, "model timeout").await?);
        let claim = store.get_claim(id).await?.unwrap();
        assert_eq!(claim.status, ClaimStatus::Failed);
        assert_eq!(claim.error_message.as_deref(), Some("model timeout"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unrecognized_event_fails_closed() -> anyhow::Result<()> {
        let (_dir, _store, guard) = guard_with(IntakeConfig::default()).await?;
        let event = InboundEvent::Unrecognized {
            kind: "pipeline".into(),
        };

        let err = guard.claim(&event).await.unwrap_err();
        assert!(matches!(err, IntakeError::UnrecognizedEvent { ref kind } if kind == "pipeline"));
        assert!(logs_contain("Refusing to claim unrecognized event kind"));
        assert_eq!(guard.stats().await?.total, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_duplicate() -> anyhow::Result<()> {
        let (_dir, store, guard) = guard_with(IntakeConfig::default()).await?;
        store.close().await;

        let err = guard.claim(&push_event()).await.unwrap_err();
        assert!(matches!(err, IntakeError::ClaimStoreUnavailable { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_reap_stale_frees_fingerprint() -> anyhow::Result<()> {
        let config = IntakeConfig::default().with_max_processing_secs(0);
        let (_dir, store, guard) = guard_with(config).await?;
        let first = guard.claim(&push_event()).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(guard.reap_stale().await?, 1);
        let claim = store.get_claim(first.claim_id.unwrap()).await?.unwrap();
        assert_eq!(claim.status, ClaimStatus::Failed);
        assert!(claim.error_message.unwrap().contains("stale"));

        assert!(guard.claim(&push_event()).await?.accepted);
        Ok(())
    }

    #[tokio::test]
    async fn test_reaper_task_runs_and_stops() -> anyhow::Result<()> {
        let config = IntakeConfig::default().with_max_processing_secs(0);
        let (_dir, _store, guard) = guard_with(config).await?;
        let guard = Arc::new(guard);
        guard.claim(&push_event()).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Arc::clone(&guard).spawn_reaper(shutdown_rx);

        // First tick fires immediately
        let mut reaped = false;
        for _ in 0..100 {
            if guard.stats().await?.failed == 1 {
                reaped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reaped);

        shutdown_tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(5), handle).await??;
        Ok(())
    }
}
