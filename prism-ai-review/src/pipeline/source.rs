//! Where repository content comes from.
//!
//! The job runner only sees [`ContentSource`]. [`DirectorySource`] reads a
//! checked-out working tree, honouring `.gitignore` the same way `git` does.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One file of a snapshot, with a `/`-separated path relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// The repository state a job embeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub revision: String,
    pub branch: String,
    pub files: Vec<SourceFile>,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetches the files of `resource_id` found at `location`.
    ///
    /// `revision` pins a specific revision where the source supports it.
    async fn fetch(
        &self,
        resource_id: &str,
        location: &str,
        revision: Option<&str>,
    ) -> Result<SourceSnapshot>;
}

/// Reads files from a local directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    max_file_bytes: u64,
}

impl Default for DirectorySource {
    fn default() -> Self {
        Self {
            max_file_bytes: 1 << 20,
        }
    }
}

impl DirectorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files larger than this are skipped without being read.
    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    fn read_tree(root: &Path, max_file_bytes: u64) -> Result<Vec<SourceFile>> {
        let mut files = Vec::new();
        let walker = ignore::WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .require_git(false)
            .filter_entry(|entry| entry.file_name() != ".git")
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > max_file_bytes {
                debug!("Skipping {} ({} bytes)", path.display(), size);
                continue;
            }
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(SourceFile {
                path: relative,
                content: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

/// Reads `(revision, branch)` from `.git/HEAD`, falling back to `working-tree`.
pub fn read_git_head(root: &Path) -> (String, String) {
    let git_dir = root.join(".git");
    let Ok(head) = std::fs::read_to_string(git_dir.join("HEAD")) else {
        return ("working-tree".to_string(), String::new());
    };
    let head = head.trim();
    match head.strip_prefix("ref: ") {
        Some(reference) => {
            let branch = reference
                .strip_prefix("refs/heads/")
                .unwrap_or(reference)
                .to_string();
            let revision = std::fs::read_to_string(git_dir.join(reference))
                .map(|r| r.trim().to_string())
                .unwrap_or_else(|_| "working-tree".to_string());
            (revision, branch)
        }
        // Detached HEAD
        None => (head.to_string(), String::new()),
    }
}

#[async_trait]
impl ContentSource for DirectorySource {
    async fn fetch(
        &self,
        resource_id: &str,
        location: &str,
        revision: Option<&str>,
    ) -> Result<SourceSnapshot> {
        let root = PathBuf::from(location);
        if !root.is_dir() {
            bail!("Source location {} for resource {} is not a directory", location, resource_id);
        }

        let max_file_bytes = self.max_file_bytes;
        let walk_root = root.clone();
        let files = tokio::task::spawn_blocking(move || Self::read_tree(&walk_root, max_file_bytes))
            .await
            .context("Directory walk panicked")??;

        let (head_revision, branch) = read_git_head(&root);
        let revision = revision.map(str::to_string).unwrap_or(head_revision);
        debug!(
            "Read {} files for resource {} at {}",
            files.len(),
            resource_id,
            revision
        );
        Ok(SourceSnapshot {
            revision,
            branch,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_reads_tree_and_honours_gitignore() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("src/nested"))?;
        fs::create_dir_all(root.join("target"))?;
        fs::create_dir_all(root.join(".git/refs/heads"))?;
        fs::write(root.join(".gitignore"), "target/\n")?;
        fs::write(root.join("src/lib.rs"), "pub fn lib() {}\n")?;
        fs::write(root.join("src/nested/mod.rs"), "mod nested;\n")?;
        fs::write(root.join("target/out.rs"), "// generated\n")?;
        fs::write(root.join(".git/HEAD"), "ref: refs/heads/feature\n")?;
        fs::write(root.join(".git/refs/heads/feature"), "0123abcd\n")?;

        let snapshot = DirectorySource::new()
            .fetch("42", &root.to_string_lossy(), None)
            .await?;
        let paths: Vec<_> = snapshot.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec![".gitignore", "src/lib.rs", "src/nested/mod.rs"]);
        assert_eq!(snapshot.revision, "0123abcd");
        assert_eq!(snapshot.branch, "feature");
        Ok(())
    }

    #[tokio::test]
    async fn test_size_limit_and_pinned_revision() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("small.rs"), "fn a() {}")?;
        fs::write(dir.path().join("large.rs"), "x".repeat(2048))?;

        let snapshot = DirectorySource::new()
            .with_max_file_bytes(1024)
            .fetch("42", &dir.path().to_string_lossy(), Some("pinned"))
            .await?;
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(snapshot.files[0].path, "small.rs");
        assert_eq!(snapshot.revision, "pinned");
        assert_eq!(snapshot.branch, "");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result = DirectorySource::new()
            .fetch("42", &missing.to_string_lossy(), None)
            .await;
        assert!(result.is_err());
    }
}
