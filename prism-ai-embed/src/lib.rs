//! # prism-ai-embed
//!
//! Client side of the remote vectorization provider used to embed repository
//! files, together with the resilience machinery around it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use prism_ai_embed::{EmbedConfig, EmbeddingProvider, HttpEmbeddingProvider, ResilientProvider};
//! use std::sync::Arc;
//!
//! # async fn example() -> prism_ai_embed::Result<()> {
//! let config = EmbedConfig::default().with_model("nomic-embed-text");
//! let http = Arc::new(HttpEmbeddingProvider::new(&config)?);
//! let provider = ResilientProvider::new(http, config.retry_policy(), config.circuit_config());
//!
//! let vector = provider.embed_text("fn main() {}").await?;
//! println!("dimension {}", vector.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`provider`]: the [`EmbeddingProvider`] trait and an HTTP implementation
//! - [`retry`]: [`RetryPolicy`] and the generic [`retry_with_backoff`] combinator
//! - [`circuit`]: the [`CircuitBreaker`] state machine
//! - [`resilient`]: [`ResilientProvider`], which layers both over any provider
//! - [`config`]: serde-friendly [`EmbedConfig`]
//! - [`error`]: [`EmbedError`] with its transient/permanent classification

pub mod circuit;
pub mod config;
pub mod error;
pub mod provider;
pub mod resilient;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState, Permit};
pub use config::{DEFAULT_API_KEY_ENV, EmbedConfig};
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, HttpEmbeddingProvider, parse_embedding_response};
pub use resilient::ResilientProvider;
pub use retry::{RetryPolicy, retry_with_backoff};
