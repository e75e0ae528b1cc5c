//! Run state persistence (`run_state.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::RunState;
use crate::io::atomic::{to_json_bytes, write_atomic};

/// Read `run_state.json`. A missing or malformed file is an error.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    let bytes = fs::read(path).with_context(|| format!("open {}", path.display()))?;
    let state = serde_json::from_slice::<RunState>(&bytes)
        .with_context(|| format!("decode {}", path.display()))?;
    debug!(run_id = %state.run_id, status = state.status.as_str(), "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file, fsync, rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(
        path = %path.display(),
        run_id = %state.run_id,
        status = state.status.as_str(),
        "writing run state"
    );
    write_atomic(path, &to_json_bytes(state)?)
        .with_context(|| format!("persist run state {}", path.display()))
}
