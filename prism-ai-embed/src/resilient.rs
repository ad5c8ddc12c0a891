//! Provider wrapper adding retry with backoff and a circuit breaker.

use crate::circuit::{CircuitBreaker, CircuitConfig, Permit};
use crate::error::{EmbedError, Result};
use crate::provider::EmbeddingProvider;
use crate::retry::{RetryPolicy, retry_with_backoff};
use async_trait::async_trait;
use std::sync::Arc;

/// Wraps any [`EmbeddingProvider`] so that each call:
///
/// 1. is rejected immediately with [`EmbedError::CircuitOpen`] while the
///    circuit is open,
/// 2. is retried per the [`RetryPolicy`] on transient errors,
/// 3. feeds its outcome into the circuit breaker.
///
/// Only transient errors count against the circuit. A permanent error (a 400,
/// an unparseable body) still proves the provider is reachable.
pub struct ResilientProvider {
    inner: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
    circuit: Arc<CircuitBreaker>,
}

impl ResilientProvider {
    pub fn new(
        inner: Arc<dyn EmbeddingProvider>,
        policy: RetryPolicy,
        circuit_config: CircuitConfig,
    ) -> Self {
        Self {
            inner,
            policy,
            circuit: Arc::new(CircuitBreaker::new(circuit_config)),
        }
    }

    /// Share an existing breaker, e.g. between the pipeline and retrieval.
    pub fn with_circuit(
        inner: Arc<dyn EmbeddingProvider>,
        policy: RetryPolicy,
        circuit: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            inner,
            policy,
            circuit,
        }
    }

    pub fn circuit(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.circuit)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn record(&self, outcome: &Result<Vec<f32>>) {
        match outcome {
            Err(e) if e.is_retryable() => self.circuit.record_failure(),
            _ => self.circuit.record_success(),
        }
    }

    async fn attempt(&self, text: &str) -> Result<Vec<f32>> {
        match self.circuit.acquire() {
            Permit::Rejected { remaining } => Err(EmbedError::CircuitOpen { remaining }),
            Permit::Call => {
                let outcome = self.inner.embed_text(text).await;
                self.record(&outcome);
                outcome
            }
            Permit::Probe => {
                let mut probe = ProbeGuard::new(&self.circuit);
                if let Some(health) = self.inner.health_check().await {
                    probe.disarm();
                    if let Err(e) = health {
                        tracing::warn!("Provider health probe failed: {}", e);
                        self.circuit.record_failure();
                        return Err(e);
                    }
                    tracing::debug!("Provider health probe succeeded");
                    self.circuit.record_success();
                }
                let outcome = self.inner.embed_text(text).await;
                probe.disarm();
                self.record(&outcome);
                outcome
            }
        }
    }
}

/// Reopens the circuit if a probe call is dropped before reporting.
struct ProbeGuard<'a> {
    circuit: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(circuit: &'a CircuitBreaker) -> Self {
        Self {
            circuit,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.circuit.abandon_probe();
        }
    }
}

#[async_trait]
impl EmbeddingProvider for ResilientProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        retry_with_backoff(&self.policy, "embed_text", EmbedError::is_retryable, |_| {
            self.attempt(text)
        })
        .await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    async fn health_check(&self) -> Option<Result<()>> {
        self.inner.health_check().await
    }
}
