//! Workspace snapshots for post-execution write checks.
//!
//! A snapshot records `(mtime, size)` per file. Diffing two snapshots finds
//! created, modified and deleted files. A file rewritten in place with the
//! same size and mtime goes unnoticed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::core::policy::{ChangeKind, PathChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    modified: Option<SystemTime>,
}

/// Files under a root, keyed by root-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    files: BTreeMap<PathBuf, FileStamp>,
}

impl WorkspaceSnapshot {
    /// Walk `root` without following symlinks. A missing root is an empty snapshot.
    pub fn capture(root: &Path) -> Result<Self> {
        Self::capture_excluding(root, &[])
    }

    /// Like [`Self::capture`], but skips `excluded` paths and everything below
    /// them. Paths are compared after canonicalization, so a workspace given
    /// as `run/..` still recognizes `run/logs`.
    pub fn capture_excluding(root: &Path, excluded: &[PathBuf]) -> Result<Self> {
        let mut files = BTreeMap::new();
        if !root.exists() {
            return Ok(Self { files });
        }
        let root = fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))?;
        let excluded: Vec<PathBuf> = excluded
            .iter()
            .map(|p| fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !excluded.iter().any(|x| e.path() == x));
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let metadata = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?;
            let rel = entry
                .path()
                .strip_prefix(&root)
                .with_context(|| format!("relativize {}", entry.path().display()))?
                .to_path_buf();
            files.insert(
                rel,
                FileStamp {
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                },
            );
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Changes from `self` to `after`, ordered by path.
    pub fn diff(&self, after: &WorkspaceSnapshot) -> Vec<PathChange> {
        let mut changes = Vec::new();
        for (path, stamp) in &after.files {
            match self.files.get(path) {
                None => changes.push(PathChange {
                    path: path.clone(),
                    kind: ChangeKind::Created,
                    size_bytes: stamp.size,
                }),
                Some(old) if old != stamp => changes.push(PathChange {
                    path: path.clone(),
                    kind: ChangeKind::Modified,
                    size_bytes: stamp.size,
                }),
                Some(_) => {}
            }
        }
        for path in self.files.keys() {
            if !after.files.contains_key(path) {
                changes.push(PathChange {
                    path: path.clone(),
                    kind: ChangeKind::Deleted,
                    size_bytes: 0,
                });
            }
        }
        changes.sort();
        changes
    }
}
