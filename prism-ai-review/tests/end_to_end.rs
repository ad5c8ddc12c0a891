//! Full flow: claim a webhook, queue an embedding job, let the worker embed a
//! checkout, then select review context from the stored records.

use anyhow::Result;
use async_trait::async_trait;
use prism_ai_embed::{CircuitState, EmbedError, EmbeddingProvider, Result as EmbedResult};
use prism_ai_review::config::ServiceConfig;
use prism_ai_review::intake::InboundEvent;
use prism_ai_review::pipeline::DirectorySource;
use prism_ai_review::retrieval::{ChangedFile, Relation};
use prism_ai_review::service::ReviewContext;
use prism_ai_review::storage::sqlite_store::SqliteStore;
use prism_ai_review::storage::{EmbeddingStore, JobStatus};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

/// Letter-frequency vectors: texts sharing vocabulary end up close.
struct LetterProvider;

#[async_trait]
impl EmbeddingProvider for LetterProvider {
    async fn embed_text(&self, text: &str) -> EmbedResult<Vec<f32>> {
        let mut vector = vec![0.0f32; 26];
        for b in text.bytes().filter(u8::is_ascii_alphabetic) {
            vector[(b.to_ascii_lowercase() - b'a') as usize] += 1.0;
        }
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        "letters"
    }

    fn provider_name(&self) -> &str {
        "test"
    }
}

struct UnavailableProvider;

#[async_trait]
impl EmbeddingProvider for UnavailableProvider {
    async fn embed_text(&self, _text: &str) -> EmbedResult<Vec<f32>> {
        Err(EmbedError::Status {
            status: 503,
            body: "overloaded".into(),
        })
    }

    fn model_name(&self) -> &str {
        "unavailable"
    }

    fn provider_name(&self) -> &str {
        "test"
    }
}

fn fast_config(db: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.store.path = db.to_path_buf();
    config.pipeline = config.pipeline.with_delays(0, 0);
    config.queue = config
        .queue
        .with_idle_sleep_ms(10)
        .with_await_poll_ms(20)
        .with_backoff(10, 50);
    config.embedding.base_delay_ms = 1;
    config.embedding.max_delay_ms = 5;
    config
}

fn write_checkout(root: &Path) -> Result<()> {
    fs::create_dir_all(root.join("src"))?;
    fs::write(
        root.join("src/auth.rs"),
        "pub fn authenticate(user: &str, token: &str) -> bool {\n    validate_token(user, token)\n}\n",
    )?;
    fs::write(
        root.join("src/token.rs"),
        "pub fn validate_token(user: &str, token: &str) -> bool {\n    !user.is_empty() && token.len() == 32\n}\n",
    )?;
    fs::write(
        root.join("src/render.rs"),
        "pub fn render(frame: &mut Frame) {\n    frame.clear();\n    frame.draw_border();\n}\n",
    )?;
    fs::write(root.join("src/generated.rs"), "\0\0\0ELF\0\0binary\0")?;
    Ok(())
}

/// Runs the worker until the job with `correlation` finishes.
async fn run_until_done(ctx: &ReviewContext, correlation: &str) -> Result<usize> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ctx.run_worker(Arc::new(DirectorySource::new()), shutdown_rx);
    let waiter = async {
        let job = ctx
            .queue()
            .await_completion(correlation, Duration::from_secs(10))
            .await;
        let _ = shutdown_tx.send(true);
        job
    };
    let (processed, job) = tokio::join!(worker, waiter);
    let job = job?.expect("job exists");
    assert!(job.status.is_terminal(), "job still {}", job.status);
    processed
}

#[tokio::test]
async fn test_webhook_to_review_context() -> Result<()> {
    let dir = tempdir()?;
    let checkout = dir.path().join("checkout");
    write_checkout(&checkout)?;
    let config = fast_config(&dir.path().join("prism.db"));
    let store = Arc::new(SqliteStore::open(&config.store.path).await?);
    let ctx = ReviewContext::assemble(config, store.clone(), Arc::new(LetterProvider));

    // The same delivery twice: only the first is processed
    let payload = json!({
        "project": {"id": 42},
        "object_attributes": {"iid": 7, "action": "open", "last_commit": {"id": "c0ffee"}}
    });
    let event = InboundEvent::from_payload("merge_request", &payload);
    let first = ctx.guard().claim(&event).await?;
    let second = ctx.guard().claim(&event).await?;
    assert!(first.accepted);
    assert!(second.is_duplicate);

    ctx.queue()
        .enqueue("42", &checkout.to_string_lossy(), "mr-7", 10, false)
        .await?;
    let processed = run_until_done(&ctx, "mr-7").await?;
    assert_eq!(processed, 1);
    assert!(ctx.guard().complete(first.claim_id.unwrap()).await?);

    let stats = ctx.queue().stats().await?;
    assert_eq!(stats.completed, 1);
    // The binary file is filtered out
    assert_eq!(store.count_records().await?, 3);

    let changed = [ChangedFile::new(
        "src/auth.rs",
        fs::read_to_string(checkout.join("src/auth.rs"))?,
    )];
    let context = ctx.context_engine().get_context("42", &changed).await?;
    assert!(!context.embedding_in_progress);
    assert_eq!(context.ranked_files[0].path, "src/auth.rs");
    assert_eq!(context.ranked_files[0].relation, Relation::Direct);
    let similar: Vec<_> = context.ranked_files[1..]
        .iter()
        .map(|f| f.path.as_str())
        .collect();
    assert_eq!(similar[0], "src/token.rs");
    assert!(!similar.contains(&"src/generated.rs"));
    assert!(context.summary.contains("### src/auth.rs (rust)"));

    let status = ctx.status().await?;
    assert_eq!(status.claims.completed, 1);
    assert_eq!(status.total_records, 3);
    assert_eq!(status.circuit.unwrap().state, CircuitState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_unavailable_provider_opens_circuit_and_requeues() -> Result<()> {
    let dir = tempdir()?;
    let checkout = dir.path().join("checkout");
    write_checkout(&checkout)?;
    let mut config = fast_config(&dir.path().join("prism.db"));
    config.embedding.max_attempts = 1;
    config.embedding.failure_threshold = 2;
    config.queue.max_attempts = 1;
    let store = Arc::new(SqliteStore::open(&config.store.path).await?);
    let ctx = ReviewContext::assemble(config, store.clone(), Arc::new(UnavailableProvider));

    ctx.queue()
        .enqueue("42", &checkout.to_string_lossy(), "mr-8", 0, false)
        .await?;
    run_until_done(&ctx, "mr-8").await?;

    let job = ctx
        .queue()
        .await_completion("mr-8", Duration::ZERO)
        .await?
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("failed to embed"));
    assert_eq!(store.count_records().await?, 0);
    assert_eq!(ctx.circuit().state(), CircuitState::Open);

    // Nothing stored yet, and no job left that could produce records
    let context = ctx
        .context_engine()
        .get_context("42", &[ChangedFile::new("src/auth.rs", "")])
        .await?;
    assert!(context.ranked_files.is_empty());
    assert!(!context.embedding_in_progress);
    Ok(())
}
