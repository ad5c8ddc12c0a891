//! Embedding generation: filter, chunk, then vectorize in paced batches.
//!
//! ```text
//! files → FileFilter → chunk_code_file → batches of N → provider (retry + circuit) → records
//!              ↓                                               ↓
//!         FilterStats                                   (path, reason) failures
//! ```
//!
//! Calls within a batch are spaced by a short delay and batches by a longer
//! one, so a large repository never floods the provider. A failed item is
//! recorded and the run continues.

use crate::storage::NewEmbeddingRecord;
use prism_ai_context::{FileFilter, FilterConfig, FilterDecision, FilterStats, chunk_code_file, detect_language};
use prism_ai_embed::{EmbeddingProvider, Result as EmbedResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod runner;
pub mod source;

pub use runner::EmbeddingJobRunner;
pub use source::{ContentSource, DirectorySource, SourceFile, SourceSnapshot};

/// Pacing, chunking and filtering settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub item_delay_ms: u64,
    pub max_chunk_bytes: usize,
    pub max_content_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay_ms: 1_000,
            item_delay_ms: 100,
            max_chunk_bytes: 8_000,
            max_content_bytes: 100_000,
        }
    }
}

impl PipelineConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets both delays; zero disables pacing.
    pub fn with_delays(mut self, batch_delay_ms: u64, item_delay_ms: u64) -> Self {
        self.batch_delay_ms = batch_delay_ms;
        self.item_delay_ms = item_delay_ms;
        self
    }

    pub fn with_max_chunk_bytes(mut self, max_chunk_bytes: usize) -> Self {
        self.max_chunk_bytes = max_chunk_bytes;
        self
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig::default().with_max_content_bytes(self.max_content_bytes)
    }
}

/// A file offered to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineItem {
    pub path: String,
    pub content: String,
}

impl PipelineItem {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Which resource, revision and branch the produced records belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedTarget {
    pub resource_id: String,
    pub revision_id: String,
    pub branch: String,
}

/// An item the provider could not embed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub path: String,
    pub reason: String,
    /// The error was transient or the circuit was open
    pub retryable: bool,
    pub circuit_open: bool,
}

/// Outcome of [`EmbeddingPipeline::embed`].
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub records: Vec<NewEmbeddingRecord>,
    pub failures: Vec<ItemFailure>,
    pub filter_stats: FilterStats,
    /// Number of chunks sent to the provider
    pub chunks_attempted: usize,
}

impl PipelineReport {
    /// Every attempted chunk failed.
    pub fn all_failed(&self) -> bool {
        self.records.is_empty() && !self.failures.is_empty()
    }
}

struct WorkItem {
    path: String,
    language: &'static str,
    content: String,
}

pub struct EmbeddingPipeline {
    provider: Arc<dyn EmbeddingProvider>,
    filter: FileFilter,
    config: PipelineConfig,
}

impl EmbeddingPipeline {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: PipelineConfig) -> Self {
        Self {
            filter: FileFilter::new(config.filter_config()),
            provider,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Vectorizes a single text, e.g. a changed file used as a similarity query.
    pub async fn embed_one(&self, text: &str) -> EmbedResult<Vec<f32>> {
        self.provider.embed_text(text).await
    }

    /// Filters, chunks and embeds `items`, producing one record per chunk.
    pub async fn embed(&self, target: &EmbedTarget, items: Vec<PipelineItem>) -> PipelineReport {
        let mut report = PipelineReport::default();
        let mut work = Vec::new();

        for item in items {
            let decision = self.filter.evaluate(&item.path, &item.content);
            report.filter_stats.record(&decision);
            if let FilterDecision::Reject(reason) = decision {
                debug!("Skipping {}: {}", item.path, reason);
                continue;
            }
            let language = detect_language(&item.path);
            for chunk in chunk_code_file(&item.path, &item.content, self.config.max_chunk_bytes) {
                work.push(WorkItem {
                    path: chunk.path,
                    language,
                    content: chunk.content,
                });
            }
        }

        info!(
            "Embedding {} chunks for resource {} ({} files accepted, {} rejected)",
            work.len(),
            target.resource_id,
            report.filter_stats.accepted,
            report.filter_stats.rejected()
        );

        let batch_size = self.config.batch_size.max(1);
        for (batch_index, batch) in work.chunks(batch_size).enumerate() {
            if batch_index > 0 && !self.config.batch_delay().is_zero() {
                tokio::time::sleep(self.config.batch_delay()).await;
            }
            for (item_index, item) in batch.iter().enumerate() {
                if item_index > 0 && !self.config.item_delay().is_zero() {
                    tokio::time::sleep(self.config.item_delay()).await;
                }
                report.chunks_attempted += 1;
                match self.provider.embed_text(&item.content).await {
                    Ok(vector) => report.records.push(NewEmbeddingRecord {
                        resource_id: target.resource_id.clone(),
                        file_path: item.path.clone(),
                        content: item.content.clone(),
                        vector,
                        language: item.language.to_string(),
                        revision_id: target.revision_id.clone(),
                        branch: target.branch.clone(),
                    }),
                    Err(e) => {
                        warn!("Failed to embed {}: {}", item.path, e);
                        report.failures.push(ItemFailure {
                            path: item.path.clone(),
                            reason: e.to_string(),
                            retryable: e.is_retryable() || e.is_circuit_open(),
                            circuit_open: e.is_circuit_open(),
                        });
                    }
                }
            }
        }

        info!(
            "Embedded {}/{} chunks for resource {}",
            report.records.len(),
            report.chunks_attempted,
            target.resource_id
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prism_ai_embed::EmbedError;
    use std::sync::Mutex;

    /// Returns a vector derived from the text; fails for texts containing "FAIL".
    struct FakeProvider {
        calls: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        async fn embed_text(&self, text: &str) -> EmbedResult<Vec<f32>> {
            self.calls.lock().unwrap().push(text.to_string());
            if text.contains("FAIL") {
                return Err(EmbedError::Status {
                    status: 400,
                    body: "rejected".into(),
                });
            }
            Ok(vec![text.len() as f32, 1.0])
        }

        fn model_name(&self) -> &str {
            "fake"
        }

        fn provider_name(&self) -> &str {
            "fake"
        }
    }

    fn target() -> EmbedTarget {
        EmbedTarget {
            resource_id: "42".into(),
            revision_id: "abc".into(),
            branch: "main".into(),
        }
    }

    fn unpaced() -> PipelineConfig {
        PipelineConfig::default().with_delays(0, 0)
    }

    #[tokio::test]
    async fn test_filters_before_embedding() {
        let provider = Arc::new(FakeProvider::new());
        let pipeline = EmbeddingPipeline::new(provider.clone(), unpaced());
        let items = vec![
            PipelineItem::new("src/main.rs", "fn main() {}\n"),
            PipelineItem::new("logo.png", "PNG"),
            PipelineItem::new("src/blob.rs", "abc\0def"),
            PipelineItem::new("Dockerfile", "FROM rust\n"),
        ];

        let report = pipeline.embed(&target(), items).await;
        let paths: Vec<_> = report.records.iter().map(|r| r.file_path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.rs", "Dockerfile"]);
        assert_eq!(report.records[0].language, "rust");
        assert_eq!(report.records[1].language, "dockerfile");
        assert_eq!(report.records[0].revision_id, "abc");
        assert_eq!(report.filter_stats.unsupported_type, 1);
        assert_eq!(report.filter_stats.binary, 1);
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_large_files_are_chunked() {
        let provider = Arc::new(FakeProvider::new());
        let pipeline =
            EmbeddingPipeline::new(provider, unpaced().with_max_chunk_bytes(100));
        let content: String = (0..20).map(|i| format!("let v{i} = {i};\n")).collect();

        let report = pipeline
            .embed(&target(), vec![PipelineItem::new("src/big.rs", content.clone())])
            .await;
        assert!(report.records.len() > 1);
        assert_eq!(report.records[0].file_path, "src/big.rs#chunk0");
        let rebuilt: String = report.records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(rebuilt, content);
    }

    #[tokio::test]
    async fn test_failed_item_does_not_stop_batch() {
        let provider = Arc::new(FakeProvider::new());
        let pipeline = EmbeddingPipeline::new(provider, unpaced());
        let items = vec![
            PipelineItem::new("a.rs", "fn a() {}"),
            PipelineItem::new("b.rs", "// FAIL here"),
            PipelineItem::new("c.rs", "fn c() {}"),
        ];

        let report = pipeline.embed(&target(), items).await;
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "b.rs");
        assert!(!report.failures[0].retryable);
        assert!(!report.all_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_paced() {
        let provider = Arc::new(FakeProvider::new());
        let pipeline = EmbeddingPipeline::new(provider, PipelineConfig::default());
        let items: Vec<_> = (0..7)
            .map(|i| PipelineItem::new(format!("f{i}.rs"), format!("fn f{i}() {{}}")))
            .collect();

        let started = tokio::time::Instant::now();
        let report = pipeline.embed(&target(), items).await;
        assert_eq!(report.records.len(), 7);
        // Batches of 5 and 2: one batch gap plus 4 + 1 item gaps
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn test_embed_one() {
        let pipeline = EmbeddingPipeline::new(Arc::new(FakeProvider::new()), unpaced());
        assert_eq!(pipeline.embed_one("abcd").await.unwrap(), vec![4.0, 1.0]);
        assert!(pipeline.embed_one("FAIL").await.is_err());
    }
}
