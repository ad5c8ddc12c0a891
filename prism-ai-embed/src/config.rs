//! Configuration for the remote embedding provider

use crate::circuit::CircuitConfig;
use crate::error::{EmbedError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default environment variable holding the provider API key.
pub const DEFAULT_API_KEY_ENV: &str = "PRISM_EMBEDDING_API_KEY";

/// Provider endpoint, model and resilience settings.
///
/// Every field has a default, so a TOML section may name only what differs:
///
/// ```
/// use prism_ai_embed::EmbedConfig;
///
/// let config: EmbedConfig = serde_json::from_str(r#"{"model": "mxbai-embed-large"}"#).unwrap();
/// assert_eq!(config.model, "mxbai-embed-large");
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// URL that accepts `POST {model, input}`
    pub endpoint: String,
    /// Model name sent with every request
    pub model: String,
    /// Name of the environment variable holding a bearer token, if any
    pub api_key_env: Option<String>,
    /// Optional URL probed with `GET` while the circuit is half-open
    pub health_url: Option<String>,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Attempts per item, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Random spread added to each backoff delay, as a fraction of it
    pub jitter: f64,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed
    pub cooldown_secs: u64,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/embed".to_string(),
            model: "nomic-embed-text".to_string(),
            api_key_env: Some(DEFAULT_API_KEY_ENV.to_string()),
            health_url: None,
            timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: 0.25,
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

impl EmbedConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_health_url(mut self, health_url: impl Into<String>) -> Self {
        self.health_url = Some(health_url.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Per-item retry schedule.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }

    /// Reads the API key from the configured environment variable.
    ///
    /// A missing or empty variable means requests are sent without authorization.
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|key| !key.trim().is_empty())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(EmbedError::invalid_config("endpoint must not be empty"));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(EmbedError::invalid_config(format!(
                "endpoint must be an http(s) URL, got {}",
                self.endpoint
            )));
        }
        if self.model.trim().is_empty() {
            return Err(EmbedError::invalid_config("model must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(EmbedError::invalid_config("max_attempts must be at least 1"));
        }
        if self.failure_threshold == 0 {
            return Err(EmbedError::invalid_config(
                "failure_threshold must be at least 1",
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(EmbedError::invalid_config(
                "base_delay_ms must not exceed max_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(EmbedError::invalid_config("jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }
}
