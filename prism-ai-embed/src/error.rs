//! Error types for the embedding system

use std::time::Duration;

/// Result type for embedding operations.
///
/// This is a convenience type alias that uses [`EmbedError`] as the error type.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Variants fall into two groups, told apart by [`EmbedError::is_retryable`]:
///
/// - **Transient**: network failures, timeouts, HTTP 408/429/5xx. Worth retrying
///   with backoff.
/// - **Permanent**: bad configuration, client errors, malformed responses and
///   an open circuit. Retrying immediately cannot help.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when the provider configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// Transport-level failure talking to the provider
    #[error("Provider request failed: {source}")]
    Request {
        #[from]
        source: reqwest::Error,
    },

    /// Provider answered with a non-success status
    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Provider answered but the body did not contain a usable vector
    #[error("Invalid provider response: {message}")]
    InvalidResponse { message: String },

    /// Calls are suspended because the provider kept failing
    #[error("Circuit open, provider calls suspended for another {remaining:?}")]
    CircuitOpen { remaining: Duration },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an invalid response error with a custom message.
    pub fn invalid_response<S: Into<String>>(message: S) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Whether the failure is transient and the call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbedError::Request { source } => !source.is_builder() && !source.is_decode(),
            EmbedError::Status { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            EmbedError::InvalidConfig { .. }
            | EmbedError::InvalidResponse { .. }
            | EmbedError::CircuitOpen { .. }
            | EmbedError::External { .. } => false,
        }
    }

    /// Whether the call was rejected by the circuit breaker without reaching the provider.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, EmbedError::CircuitOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let status = |status| EmbedError::Status {
            status,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(408).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!EmbedError::invalid_config("no model").is_retryable());
        assert!(!EmbedError::invalid_response("no vector").is_retryable());
        let open = EmbedError::CircuitOpen {
            remaining: Duration::from_secs(3),
        };
        assert!(!open.is_retryable());
        assert!(open.is_circuit_open());
    }
}
