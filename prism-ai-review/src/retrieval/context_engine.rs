//! Context selection over stored embedding records.
//!
//! Files the change touches come first, followed by nearest neighbours of the
//! changed content. Equal scores are broken by path so that the same records
//! always give the same context.

use crate::pipeline::EmbeddingPipeline;
use crate::storage::{EmbeddingRecord, EmbeddingStore, JobStore};
use anyhow::{Context, Result};
use prism_ai_context::strip_chunk_suffix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Selection and rendering limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// With at least this many directly related files, skip similarity search
    pub min_direct_matches: usize,
    pub max_files: usize,
    pub neighbours_per_file: usize,
    /// Changed files with fewer non-whitespace characters are not used as queries
    pub min_query_chars: usize,
    pub excerpt_chars: usize,
    pub summary_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            min_direct_matches: 3,
            max_files: 10,
            neighbours_per_file: 5,
            min_query_chars: 50,
            excerpt_chars: 500,
            summary_chars: 8_000,
        }
    }
}

impl RetrievalConfig {
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_min_direct_matches(mut self, min_direct_matches: usize) -> Self {
        self.min_direct_matches = min_direct_matches;
        self
    }

    pub fn with_summary_limits(mut self, excerpt_chars: usize, summary_chars: usize) -> Self {
        self.excerpt_chars = excerpt_chars;
        self.summary_chars = summary_chars;
        self
    }
}

/// A file touched by the change under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

impl ChangedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// The file itself is part of the change
    Direct,
    /// Content close to a changed file
    Similar,
}

/// One selected file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedFile {
    pub path: String,
    pub language: String,
    pub relation: Relation,
    /// Stored chunks of the file; zero for similar files
    pub matched_chunks: usize,
    /// Cosine similarity for similar files
    pub score: Option<f32>,
    pub revision_id: String,
    #[serde(skip)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextResult {
    pub ranked_files: Vec<RankedFile>,
    pub summary: String,
    /// No records exist yet but a job for the resource is queued or running
    pub embedding_in_progress: bool,
}

pub struct ContextEngine {
    store: Arc<dyn EmbeddingStore>,
    pipeline: Arc<EmbeddingPipeline>,
    jobs: Option<Arc<dyn JobStore>>,
    config: RetrievalConfig,
}

impl ContextEngine {
    pub fn new(
        store: Arc<dyn EmbeddingStore>,
        pipeline: Arc<EmbeddingPipeline>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            jobs: None,
            config,
        }
    }

    /// Lets an empty result report whether embedding is still underway.
    pub fn with_job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Selects and renders context for `changed` files of `resource_id`.
    ///
    /// Directly related files come first, most stored chunks first, then by
    /// path. When fewer than `min_direct_matches` are found, similar files are
    /// appended in query order, best score first. At most `max_files` are
    /// returned.
    pub async fn get_context(
        &self,
        resource_id: &str,
        changed: &[ChangedFile],
    ) -> Result<ContextResult> {
        let records = self
            .store
            .records_for_resource(resource_id)
            .await
            .with_context(|| format!("Failed to load records for resource {resource_id}"))?;

        if records.is_empty() {
            let embedding_in_progress = self.embedding_in_progress(resource_id).await;
            debug!(
                "No records for resource {} (embedding in progress: {})",
                resource_id, embedding_in_progress
            );
            return Ok(ContextResult {
                embedding_in_progress,
                ..ContextResult::default()
            });
        }

        let changed_paths: HashSet<&str> = changed.iter().map(|c| normalize_path(&c.path)).collect();
        let mut ranked = direct_matches(&records, &changed_paths);
        let direct = ranked.len();

        if direct < self.config.min_direct_matches {
            let similar = self
                .similar_files(resource_id, changed, &ranked, &changed_paths)
                .await?;
            ranked.extend(similar);
        }
        ranked.truncate(self.config.max_files);

        info!(
            "Selected {} context files for resource {} ({} direct)",
            ranked.len(),
            resource_id,
            direct.min(ranked.len())
        );
        let summary = render_summary(&ranked, &self.config);
        Ok(ContextResult {
            ranked_files: ranked,
            summary,
            embedding_in_progress: false,
        })
    }

    async fn embedding_in_progress(&self, resource_id: &str) -> bool {
        let Some(jobs) = &self.jobs else {
            return false;
        };
        match jobs.has_active_job(resource_id).await {
            Ok(active) => active,
            Err(e) => {
                warn!("Could not check job state for {}: {:#}", resource_id, e);
                false
            }
        }
    }

    async fn similar_files(
        &self,
        resource_id: &str,
        changed: &[ChangedFile],
        direct: &[RankedFile],
        changed_paths: &HashSet<&str>,
    ) -> Result<Vec<RankedFile>> {
        let mut selected: HashSet<String> = direct.iter().map(|f| f.path.clone()).collect();
        selected.extend(changed_paths.iter().map(|p| p.to_string()));
        let room = self.config.max_files.saturating_sub(direct.len());
        let mut found = Vec::new();

        for file in changed {
            if found.len() >= room {
                break;
            }
            let significant = file.content.chars().filter(|c| !c.is_whitespace()).count();
            if significant < self.config.min_query_chars {
                debug!("Not querying with {} ({} chars)", file.path, significant);
                continue;
            }
            let query = match self.pipeline.embed_one(&file.content).await {
                Ok(query) => query,
                Err(e) => {
                    warn!("Skipping similarity search for {}: {}", file.path, e);
                    continue;
                }
            };

            // Several hits may be chunks of one file, so ask for more than needed
            let limit = self.config.neighbours_per_file * 4 + selected.len();
            let hits = self
                .store
                .nearest_neighbours(resource_id, &query, limit)
                .await?;

            let mut taken = 0;
            for (record, score) in hits {
                if taken >= self.config.neighbours_per_file {
                    break;
                }
                let source = strip_chunk_suffix(&record.file_path).to_string();
                if !selected.insert(source.clone()) {
                    continue;
                }
                taken += 1;
                found.push(RankedFile {
                    path: source,
                    language: record.language,
                    relation: Relation::Similar,
                    matched_chunks: 0,
                    score: Some(score),
                    revision_id: record.revision_id,
                    content: record.content,
                });
            }
        }

        Ok(found)
    }
}

fn normalize_path(path: &str) -> &str {
    path.trim_start_matches("./").trim_start_matches('/')
}

fn chunk_sequence(path: &str) -> usize {
    let stripped = strip_chunk_suffix(path);
    path[stripped.len()..]
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .unwrap_or(0)
}

/// Groups records of changed files by source path. The result is ordered by
/// number of chunks, descending, then by path.
fn direct_matches(records: &[EmbeddingRecord], changed: &HashSet<&str>) -> Vec<RankedFile> {
    let mut groups: BTreeMap<&str, Vec<&EmbeddingRecord>> = BTreeMap::new();
    for record in records {
        let source = strip_chunk_suffix(&record.file_path);
        if changed.contains(source) {
            groups.entry(source).or_default().push(record);
        }
    }

    let mut ranked: Vec<RankedFile> = groups
        .into_iter()
        .map(|(path, mut chunks)| {
            chunks.sort_by_key(|r| chunk_sequence(&r.file_path));
            let distinct: BTreeSet<&str> = chunks.iter().map(|r| r.file_path.as_str()).collect();
            let mut seen = HashSet::new();
            let content = chunks
                .iter()
                .filter(|r| seen.insert(r.file_path.as_str()))
                .map(|r| r.content.as_str())
                .collect::<String>();
            RankedFile {
                path: path.to_string(),
                language: chunks[0].language.clone(),
                relation: Relation::Direct,
                matched_chunks: distinct.len(),
                score: None,
                revision_id: chunks[0].revision_id.clone(),
                content,
            }
        })
        .collect();

    // Stable, so equal counts keep path order
    ranked.sort_by(|a, b| b.matched_chunks.cmp(&a.matched_chunks));
    ranked
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Renders `files` as markdown sections, bounded to `summary_chars`.
fn render_summary(files: &[RankedFile], config: &RetrievalConfig) -> String {
    let mut summary = String::new();
    let mut used = 0usize;

    for file in files {
        let mut section = String::new();
        let _ = match file.relation {
            Relation::Direct => writeln!(
                section,
                "### {} ({}) [changed, {} chunks]",
                file.path, file.language, file.matched_chunks
            ),
            Relation::Similar => writeln!(
                section,
                "### {} ({}) [similar, score {:.3}]",
                file.path,
                file.language,
                file.score.unwrap_or_default()
            ),
        };
        let excerpt = truncate_chars(file.content.trim_end(), config.excerpt_chars);
        let _ = writeln!(section, "```{}\n{}\n```\n", file.language, excerpt);

        let len = section.chars().count();
        if used + len > config.summary_chars {
            if summary.is_empty() {
                summary = section.chars().take(config.summary_chars).collect();
            }
            break;
        }
        used += len;
        summary.push_str(&section);
    }

    summary
}
