//! Review context retrieval.
//!
//! Given the files changed in a review, [`ContextEngine`] selects related
//! repository files from the embedding store: files the change touches
//! directly first, then files whose content is semantically close to the
//! changed content. The result is rendered into a bounded text summary for a
//! downstream reviewer prompt.

pub mod context_engine;

pub use context_engine::{
    ChangedFile, ContextEngine, ContextResult, RankedFile, Relation, RetrievalConfig,
};
