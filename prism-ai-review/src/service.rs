//! Wires the store, intake guard, queue, pipeline and retrieval together.

use crate::config::ServiceConfig;
use crate::intake::IntakeGuard;
use crate::pipeline::{ContentSource, EmbeddingJobRunner, EmbeddingPipeline};
use crate::queue::JobQueue;
use crate::queue::worker::QueueWorker;
use crate::retrieval::ContextEngine;
use crate::status::ServiceStatus;
use crate::storage::sqlite_store::SqliteStore;
use anyhow::{Context, Result};
use prism_ai_embed::{CircuitBreaker, EmbeddingProvider, HttpEmbeddingProvider, ResilientProvider};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// One process worth of components, sharing a store and a circuit breaker.
pub struct ReviewContext {
    config: ServiceConfig,
    store: Arc<SqliteStore>,
    guard: Arc<IntakeGuard>,
    queue: Arc<JobQueue>,
    pipeline: Arc<EmbeddingPipeline>,
    circuit: Arc<CircuitBreaker>,
}

impl ReviewContext {
    /// Opens the configured store and HTTP embedding provider.
    pub async fn open(config: ServiceConfig) -> Result<Self> {
        let provider = HttpEmbeddingProvider::new(&config.embedding)
            .context("Failed to create embedding provider")?;
        let store = config.store.open().await?;
        Ok(Self::assemble(config, Arc::new(store), Arc::new(provider)))
    }

    /// Builds the components around an existing store and a raw provider.
    ///
    /// The provider is wrapped with the configured retry policy and circuit
    /// breaker; pass an unwrapped provider.
    pub fn assemble(
        config: ServiceConfig,
        store: Arc<SqliteStore>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let circuit = Arc::new(CircuitBreaker::new(config.embedding.circuit_config()));
        let resilient = ResilientProvider::with_circuit(
            provider,
            config.embedding.retry_policy(),
            Arc::clone(&circuit),
        );
        let pipeline = Arc::new(EmbeddingPipeline::new(
            Arc::new(resilient),
            config.pipeline.clone(),
        ));
        let guard = Arc::new(IntakeGuard::new(store.clone(), config.intake.clone()));
        let queue = Arc::new(JobQueue::new(store.clone(), config.queue.clone()));

        Self {
            config,
            store,
            guard,
            queue,
            pipeline,
            circuit,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn guard(&self) -> &Arc<IntakeGuard> {
        &self.guard
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pipeline(&self) -> &Arc<EmbeddingPipeline> {
        &self.pipeline
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn context_engine(&self) -> ContextEngine {
        ContextEngine::new(
            self.store.clone(),
            Arc::clone(&self.pipeline),
            self.config.retrieval.clone(),
        )
        .with_job_store(self.store.clone())
    }

    pub fn job_runner(&self, source: Arc<dyn ContentSource>) -> EmbeddingJobRunner {
        EmbeddingJobRunner::new(source, Arc::clone(&self.pipeline), self.store.clone())
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        ServiceStatus::collect(
            self.guard.instance_id(),
            self.store.as_ref(),
            Some(self.circuit.as_ref()),
        )
        .await
    }

    /// Runs the queue worker and the claim reaper until `shutdown` turns true.
    /// Returns the number of jobs processed.
    pub async fn run_worker(
        &self,
        source: Arc<dyn ContentSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<usize> {
        let reaper = Arc::clone(&self.guard).spawn_reaper(shutdown.clone());
        let worker = QueueWorker::new(Arc::clone(&self.queue), Arc::new(self.job_runner(source)))
            .spawn(shutdown);

        let processed = worker.await.context("Queue worker task failed")?;
        reaper.await.context("Reaper task failed")?;
        info!("Worker for instance {} shut down", self.guard.instance_id());
        Ok(processed)
    }
}
