//! Service configuration loaded from TOML.
//!
//! Every section is optional. A minimal file only needs the values that differ
//! from the defaults:
//!
//! ```toml
//! [store]
//! path = "/var/lib/prism/prism-ai.db"
//!
//! [embedding]
//! endpoint = "https://embeddings.internal/v1/embed"
//! model = "nomic-embed-text"
//! api_key_env = "PRISM_EMBEDDING_API_KEY"
//!
//! [queue]
//! max_attempts = 5
//! ```

use crate::intake::IntakeConfig;
use crate::pipeline::PipelineConfig;
use crate::queue::QueueConfig;
use crate::retrieval::RetrievalConfig;
use crate::storage::sqlite_store::{DEFAULT_DB_FILE, SqliteStore};
use anyhow::{Context, Result, bail};
use prism_ai_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_FILE),
            busy_timeout_ms: 5_000,
            max_connections: 8,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub async fn open(&self) -> Result<SqliteStore> {
        SqliteStore::connect(&self.path, self.busy_timeout(), self.max_connections).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub intake: IntakeConfig,
    pub queue: QueueConfig,
    pub pipeline: PipelineConfig,
    pub embedding: EmbedConfig,
    pub retrieval: RetrievalConfig,
}

impl ServiceConfig {
    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.path.as_os_str().is_empty() {
            bail!("store.path must not be empty");
        }
        if self.store.max_connections == 0 {
            bail!("store.max_connections must be >= 1");
        }
        if self.intake.instance_id.trim().is_empty() {
            bail!("intake.instance_id must not be empty");
        }
        if self.intake.max_processing_secs == 0 {
            bail!("intake.max_processing_secs must be > 0");
        }
        if self.queue.max_attempts == 0 {
            bail!("queue.max_attempts must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.queue.jitter) {
            bail!("queue.jitter must be in [0.0, 1.0]");
        }
        if self.pipeline.batch_size == 0 {
            bail!("pipeline.batch_size must be >= 1");
        }
        if self.pipeline.max_chunk_bytes == 0 {
            bail!("pipeline.max_chunk_bytes must be > 0");
        }
        if self.retrieval.max_files == 0 {
            bail!("retrieval.max_files must be >= 1");
        }
        self.embedding
            .validate()
            .context("Invalid [embedding] section")?;
        Ok(())
    }
}
