//! Kernel configuration stored at `<run_root>/kernel.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// Kernel configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Timeout for steps without a `timeout_policy`. `None` waits forever.
    pub default_step_timeout_secs: Option<u64>,

    /// Timeout for gates without `timeout_seconds`.
    pub default_gate_timeout_secs: Option<u64>,

    /// Bytes of stdout/stderr kept per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,

    /// Upper bound on step executions per run. Exceeding it blocks the run.
    pub max_step_executions: u64,

    /// Sleep `backoff_seconds` before re-executing a retried step.
    pub honor_backoff: bool,

    /// Workspace the policy snapshot watches. Relative paths resolve against the run root.
    pub workspace_dir: Option<PathBuf>,

    /// Lock file hashed into the environment snapshot.
    pub dependency_lock_file: Option<PathBuf>,

    /// Extra `*.schema.json` files to register at start-up.
    pub schema_dir: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: Some(30 * 60),
            default_gate_timeout_secs: Some(10 * 60),
            output_limit_bytes: 1_000_000,
            max_step_executions: 1_000,
            honor_backoff: true,
            workspace_dir: None,
            dependency_lock_file: None,
            schema_dir: None,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_step_timeout_secs == Some(0) {
            return Err(anyhow!("default_step_timeout_secs must be > 0"));
        }
        if self.default_gate_timeout_secs == Some(0) {
            return Err(anyhow!("default_gate_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_step_executions == 0 {
            return Err(anyhow!("max_step_executions must be > 0"));
        }
        Ok(())
    }

    /// Resolve `path` against `run_root` unless it is absolute.
    pub fn resolve(run_root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            run_root.join(path)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &KernelConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
