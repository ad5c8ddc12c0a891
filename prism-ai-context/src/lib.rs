//! prism-ai-context: content handling for the embedding pipeline.
//!
//! Everything in this crate is synchronous and side-effect free, so it can be
//! called from inside async tasks without blocking on I/O.
//!
//! - [`filter`]: decides whether a repository file should be embedded at all
//! - [`chunk`]: splits oversized files on line boundaries into `path#chunkN` pieces
//! - [`language`]: file-type allow-list and language labels

pub mod chunk;
pub mod filter;
pub mod language;

// Re-export the entry points used by the pipeline
pub use chunk::{FileChunk, chunk_code_file, strip_chunk_suffix};
pub use filter::{FileFilter, FilterConfig, FilterDecision, FilterStats, RejectReason};
pub use language::detect_language;
