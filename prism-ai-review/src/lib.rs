//! prism-ai-review: context preparation for automated code review
//!
//! Webhook events for a repository arrive possibly duplicated and possibly at
//! several instances at once. This crate makes sure each one is processed once,
//! keeps an embedding index of the repository up to date through a durable
//! job queue, and selects related files for the change under review.
//!
//! ## Key Modules
//!
//! - **[`intake`]**: event fingerprints and the claim-based [`IntakeGuard`](intake::IntakeGuard)
//! - **[`queue`]**: durable priority queue with retry, backoff and a worker loop
//! - **[`pipeline`]**: filtering, chunking and paced embedding of repository files
//! - **[`retrieval`]**: direct and similarity-based context selection
//! - **[`storage`]**: store traits with the SQLite implementation
//! - **[`config`]**, **[`status`]**, **[`service`]**: configuration, diagnostics and wiring
//!
//! ## Architecture
//!
//! ```text
//! webhook → IntakeGuard (claim) → JobQueue.enqueue ─┐
//!                                                   ↓
//!            QueueWorker → EmbeddingJobRunner → ContentSource → EmbeddingPipeline → SQLite
//!                                                                                      ↓
//!                                        review ← ContextEngine.get_context ←──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use prism_ai_review::config::ServiceConfig;
//! use prism_ai_review::retrieval::ChangedFile;
//! use prism_ai_review::service::ReviewContext;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = ReviewContext::open(ServiceConfig::default()).await?;
//! ctx.queue().enqueue("42", "/srv/checkouts/42", "mr-7", 10, false).await?;
//!
//! let changed = [ChangedFile::new("src/auth.rs", std::fs::read_to_string("src/auth.rs")?)];
//! let context = ctx.context_engine().get_context("42", &changed).await?;
//! println!("{}", context.summary);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod intake;
pub mod pipeline;
pub mod queue;
pub mod retrieval;
pub mod service;
pub mod status;
pub mod storage;
