//! Decides which repository files are worth sending to the embedding provider.
//!
//! Every candidate goes through three gates, in this order:
//!
//! 1. **File type**: the suffix must be on the allow-list in
//!    [`crate::language`], or the name must be a known special file
//!    (`Dockerfile`, `Makefile`, ...). Suffix-less files that are neither fall
//!    back to a heuristic: a source-like directory in the path, or code-like
//!    lexical patterns in the content.
//! 2. **Binary detection**: control bytes, or a high share of non-printable
//!    characters in the leading sample.
//! 3. **Size**: content above the configured limit is dropped, never truncated.
//!
//! Decisions are tallied in [`FilterStats`] so callers can log them.

use crate::language::{extension_language, extension_of, special_file_language};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Directory names that mark a suffix-less file as probably source code.
pub const SOURCE_DIR_HINTS: &[&str] = &[
    "src", "lib", "app", "pkg", "cmd", "scripts", "bin", "tools", "internal",
];

static CONTROL_FLOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(if|else|for|while|return|function|def|class|import|switch|case|try|catch|fn|let|const|var|echo|then|fi|do|done)\b",
    )
    .expect("static control-flow pattern")
});

static MARKUP_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?[A-Za-z][A-Za-z0-9-]*(\s[^<>]*)?/?>").expect("static markup pattern")
});

/// Thresholds for the filter.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Content longer than this (in bytes) is dropped
    pub max_content_bytes: usize,
    /// How many leading bytes are inspected for binary content
    pub binary_sample_bytes: usize,
    /// Share of non-printable characters above which content counts as binary
    pub max_non_printable_ratio: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: 100_000,
            binary_sample_bytes: 8 * 1024,
            max_non_printable_ratio: 0.3,
        }
    }
}

impl FilterConfig {
    pub fn with_max_content_bytes(mut self, max_content_bytes: usize) -> Self {
        self.max_content_bytes = max_content_bytes;
        self
    }
}

/// Why a file was kept out of the embedding set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Suffix not on the allow-list and no heuristic matched
    UnsupportedType,
    /// Empty or whitespace-only content
    Empty,
    /// Control bytes or mostly non-printable content
    Binary,
    /// Content larger than the configured limit
    TooLarge { size: usize, limit: usize },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnsupportedType => write!(f, "unsupported file type"),
            RejectReason::Empty => write!(f, "empty content"),
            RejectReason::Binary => write!(f, "binary content"),
            RejectReason::TooLarge { size, limit } => {
                write!(f, "content too large ({size} bytes, limit {limit})")
            }
        }
    }
}

/// Outcome of [`FileFilter::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FilterDecision {
    Accept,
    Reject(RejectReason),
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accept)
    }
}

/// Counts of filter decisions, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub accepted: usize,
    pub unsupported_type: usize,
    pub empty: usize,
    pub binary: usize,
    pub too_large: usize,
}

impl FilterStats {
    pub fn record(&mut self, decision: &FilterDecision) {
        match decision {
            FilterDecision::Accept => self.accepted += 1,
            FilterDecision::Reject(RejectReason::UnsupportedType) => self.unsupported_type += 1,
            FilterDecision::Reject(RejectReason::Empty) => self.empty += 1,
            FilterDecision::Reject(RejectReason::Binary) => self.binary += 1,
            FilterDecision::Reject(RejectReason::TooLarge { .. }) => self.too_large += 1,
        }
    }

    pub fn rejected(&self) -> usize {
        self.unsupported_type + self.empty + self.binary + self.too_large
    }

    pub fn total(&self) -> usize {
        self.accepted + self.rejected()
    }
}

/// File filter applied before vectorization. See module docs for the gate order.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    config: FilterConfig,
}

impl FileFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Runs all gates against one file.
    pub fn evaluate(&self, path: &str, content: &str) -> FilterDecision {
        if !is_supported_path(path, content) {
            return FilterDecision::Reject(RejectReason::UnsupportedType);
        }
        if content.trim().is_empty() {
            return FilterDecision::Reject(RejectReason::Empty);
        }
        if is_binary_content(
            content,
            self.config.binary_sample_bytes,
            self.config.max_non_printable_ratio,
        ) {
            return FilterDecision::Reject(RejectReason::Binary);
        }
        if content.len() > self.config.max_content_bytes {
            return FilterDecision::Reject(RejectReason::TooLarge {
                size: content.len(),
                limit: self.config.max_content_bytes,
            });
        }
        FilterDecision::Accept
    }
}

/// Type gate: allow-listed suffix, special name, or suffix-less heuristic.
///
/// A file with an unrecognized suffix (`image.png`, `archive.zip`) is rejected
/// without looking at its content.
pub fn is_supported_path(path: &str, content: &str) -> bool {
    if special_file_language(path).is_some() {
        return true;
    }
    match extension_of(path) {
        Some(_) => extension_language(path).is_some(),
        None => has_source_dir_hint(path) || looks_like_code(content),
    }
}

/// Whether any directory component of `path` is a source-like directory name.
pub fn has_source_dir_hint(path: &str) -> bool {
    let mut components: Vec<&str> = path.split(['/', '\\']).collect();
    // Last component is the file itself
    components.pop();
    components
        .iter()
        .any(|dir| SOURCE_DIR_HINTS.contains(&dir.to_ascii_lowercase().as_str()))
}

/// Lexical heuristic for suffix-less files: shebang, control-flow keywords,
/// bracket density or markup tags.
pub fn looks_like_code(content: &str) -> bool {
    let sample = leading_sample(content, 4096);
    if sample.starts_with("#!") {
        return true;
    }
    if CONTROL_FLOW.find_iter(sample).take(2).count() >= 2 {
        return true;
    }
    let brackets = sample
        .chars()
        .filter(|c| matches!(c, '{' | '}' | '(' | ')' | '[' | ']' | ';'))
        .count();
    let visible = sample.chars().filter(|c| !c.is_whitespace()).count();
    if brackets >= 4 && visible > 0 && brackets as f32 / visible as f32 > 0.05 {
        return true;
    }
    MARKUP_TAG.find_iter(sample).take(2).count() >= 2
}

/// Binary gate. Control characters other than common whitespace mark the
/// content as binary outright; otherwise the share of non-printable characters
/// (including U+FFFD left behind by lossy decoding) is compared with the limit.
pub fn is_binary_content(content: &str, sample_bytes: usize, max_non_printable_ratio: f32) -> bool {
    let sample = leading_sample(content, sample_bytes);
    let mut total = 0usize;
    let mut non_printable = 0usize;
    for c in sample.chars() {
        total += 1;
        match c {
            '\t' | '\n' | '\r' | '\u{0C}' => {}
            '\u{00}'..='\u{08}' | '\u{0E}'..='\u{1F}' => return true,
            '\u{FFFD}' => non_printable += 1,
            c if c.is_control() => non_printable += 1,
            _ => {}
        }
    }
    total > 0 && non_printable as f32 / total as f32 > max_non_printable_ratio
}

/// Longest prefix of `content` no longer than `max_bytes`, cut on a char boundary.
fn leading_sample(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut end = max_bytes;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}
