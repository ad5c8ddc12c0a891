//! Line-boundary chunking for files that exceed the provider's input budget.
//!
//! A file at or under the limit is returned as a single chunk that keeps its
//! original path. Larger files are split into sequentially numbered chunks
//! named `path#chunk0`, `path#chunk1`, ... Splits happen after a newline so
//! that each chunk holds whole lines; a single line longer than the limit is
//! cut on a character boundary instead.
//!
//! Concatenating the chunk contents in sequence order reproduces the input
//! byte for byte:
//!
//! ```
//! use prism_ai_context::chunk::chunk_code_file;
//!
//! let content = "fn a() {}\nfn b() {}\nfn c() {}\n";
//! let chunks = chunk_code_file("src/lib.rs", content, 12);
//! assert_eq!(chunks.len(), 3);
//! assert_eq!(chunks[1].path, "src/lib.rs#chunk1");
//!
//! let rebuilt: String = chunks.iter().map(|c| c.content.as_str()).collect();
//! assert_eq!(rebuilt, content);
//! ```

use serde::Serialize;

/// Separator between a file path and its chunk number.
pub const CHUNK_MARKER: &str = "#chunk";

/// One independently embeddable piece of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChunk {
    /// Path used as the embedding key (`path` or `path#chunkN`)
    pub path: String,
    /// Path of the file the chunk came from
    pub source_path: String,
    /// Position of this chunk within the file (0-indexed)
    pub sequence: usize,
    /// The chunk's text
    pub content: String,
}

/// Builds the key of chunk `sequence` of `path`.
pub fn chunk_path(path: &str, sequence: usize) -> String {
    format!("{path}{CHUNK_MARKER}{sequence}")
}

/// Strips a trailing `#chunkN` marker, returning the originating file path.
pub fn strip_chunk_suffix(path: &str) -> &str {
    match path.rfind(CHUNK_MARKER) {
        Some(idx) => {
            let digits = &path[idx + CHUNK_MARKER.len()..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                &path[..idx]
            } else {
                path
            }
        }
        None => path,
    }
}

/// Splits `content` into chunks of at most `max_chunk_bytes` bytes.
///
/// Returns an empty vector for empty content.
pub fn chunk_code_file(path: &str, content: &str, max_chunk_bytes: usize) -> Vec<FileChunk> {
    if content.is_empty() {
        return Vec::new();
    }
    let max_chunk_bytes = max_chunk_bytes.max(1);
    if content.len() <= max_chunk_bytes {
        return vec![FileChunk {
            path: path.to_string(),
            source_path: path.to_string(),
            sequence: 0,
            content: content.to_string(),
        }];
    }

    let mut pieces: Vec<&str> = Vec::new();
    let mut start = 0usize;
    let mut end = 0usize;

    for line in content.split_inclusive('\n') {
        if end - start + line.len() <= max_chunk_bytes {
            end += line.len();
            continue;
        }
        if end > start {
            pieces.push(&content[start..end]);
            start = end;
        }
        if line.len() <= max_chunk_bytes {
            end += line.len();
            continue;
        }
        // Oversized single line
        let line_end = end + line.len();
        while line_end - start > max_chunk_bytes {
            let mut cut = start + max_chunk_bytes;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut == start {
                // Limit smaller than one character; take the whole character
                cut = start + content[start..].chars().next().map_or(1, char::len_utf8);
            }
            pieces.push(&content[start..cut]);
            start = cut;
        }
        end = line_end;
    }
    if end > start {
        pieces.push(&content[start..end]);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(sequence, piece)| FileChunk {
            path: chunk_path(path, sequence),
            source_path: path.to_string(),
            sequence,
            content: piece.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuild(chunks: &[FileChunk]) -> String {
        chunks.iter().map(|c| c.content.as_str()).collect()
    }

    #[test]
    fn test_small_file_keeps_path() {
        let chunks = chunk_code_file("src/main.rs", "fn main() {}\n", 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].path, "src/main.rs");
        assert_eq!(chunks[0].sequence, 0);
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        assert!(chunk_code_file("a.rs", "", 10).is_empty());
    }

    #[test]
    fn test_chunks_split_on_lines_and_reassemble() {
        let content: String = (0..200).map(|i| format!("let value_{i} = {i};\n")).collect();
        let chunks = chunk_code_file("src/values.rs", &content, 256);

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
            assert_eq!(chunk.path, format!("src/values.rs#chunk{i}"));
            assert_eq!(chunk.source_path, "src/values.rs");
            assert!(chunk.content.len() <= 256);
            assert!(chunk.content.ends_with('\n'));
        }
        assert_eq!(rebuild(&chunks), content);
    }

    #[test]
    fn test_oversized_line_is_hard_split() {
        let long_line = "x".repeat(25);
        let content = format!("short\n{long_line}\ntail");
        let chunks = chunk_code_file("a.txt", &content, 10);

        assert!(chunks.iter().all(|c| c.content.len() <= 10));
        assert_eq!(rebuild(&chunks), content);
    }

    #[test]
    fn test_multibyte_content_reassembles() {
        let content = "// héllo wörld ünïcödé\n".repeat(20);
        let chunks = chunk_code_file("src/i18n.rs", &content, 7);
        assert_eq!(rebuild(&chunks), content);
    }

    #[test]
    fn test_strip_chunk_suffix() {
        assert_eq!(strip_chunk_suffix("src/a.rs#chunk12"), "src/a.rs");
        assert_eq!(strip_chunk_suffix("src/a.rs"), "src/a.rs");
        assert_eq!(strip_chunk_suffix("docs/#chunkless.md"), "docs/#chunkless.md");
        assert_eq!(strip_chunk_suffix(&chunk_path("x/y.py", 3)), "x/y.py");
    }
}
