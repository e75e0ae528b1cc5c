//! File publication primitives.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replace `path` atomically: write a temp file, fsync it, rename over the
/// target, then fsync the parent directory so the rename itself is durable.
///
/// Readers see either the old contents or the new ones, never a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = write_temp(path, contents)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("replace {}", path.display()));
    }
    sync_parent(path)
}

/// Flush directory entries of `path`'s parent. Directories cannot be opened
/// as files on every platform; there this is a no-op.
pub fn sync_parent(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let dir = File::open(parent)
            .with_context(|| format!("open directory {}", parent.display()))?;
        dir.sync_all()
            .with_context(|| format!("sync directory {}", parent.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Publish `contents` at `path` only if nothing is there yet.
///
/// Returns `false` when the path already existed; the existing file is left
/// untouched. Concurrent writers race on a hard link, so exactly one wins.
pub fn write_new(path: &Path, contents: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let tmp_path = write_temp(path, contents)?;
    let linked = fs::hard_link(&tmp_path, path);
    let _ = fs::remove_file(&tmp_path);
    match linked {
        Ok(()) => sync_parent(path).map(|()| true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("publish {}", path.display())),
    }
}

/// Serialize as pretty JSON with a trailing newline.
pub fn to_json_bytes<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    Ok(buf.into_bytes())
}

fn write_temp(path: &Path, contents: &[u8]) -> Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = unique_temp_path(path);
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("create temp file {}", tmp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
    Ok(tmp_path)
}

fn unique_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
}
