//! Environment snapshot captured once per run.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::EnvironmentSnapshot;
use crate::io::artifact_store::sha256_hex;

/// Describe the host and, when given, hash the dependency lock file.
///
/// A lock file that does not exist is recorded by path with no hash.
pub fn capture_environment(lock_file: Option<&Path>, now: &str) -> Result<EnvironmentSnapshot> {
    let (dependency_lock_path, dependency_lock_hash) = match lock_file {
        None => (None, None),
        Some(path) if !path.exists() => (Some(path.display().to_string()), None),
        Some(path) => {
            let bytes =
                fs::read(path).with_context(|| format!("read lock file {}", path.display()))?;
            (Some(path.display().to_string()), Some(sha256_hex(&bytes)))
        }
    };
    Ok(EnvironmentSnapshot {
        kernel_version: env!("CARGO_PKG_VERSION").to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        family: std::env::consts::FAMILY.to_string(),
        dependency_lock_path,
        dependency_lock_hash,
        captured_at: now.to_string(),
    })
}
