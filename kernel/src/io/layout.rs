//! Run directory layout.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Stable paths under one run root.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub state_path: PathBuf,
    pub graph_path: PathBuf,
    pub config_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub outputs_dir: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state_path: root.join("run_state.json"),
            graph_path: root.join("graph.json"),
            config_path: root.join("kernel.toml"),
            artifacts_dir: root.join("artifacts"),
            logs_dir: root.join("logs"),
            outputs_dir: root.join("outputs"),
        }
    }

    /// Default workspace; `KernelConfig::workspace_dir` overrides it.
    pub fn default_workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Everything under the root the kernel itself writes. A workspace that
    /// overlaps the run root skips these when snapshotting.
    pub fn managed_paths(&self) -> Vec<PathBuf> {
        vec![
            self.state_path.clone(),
            self.graph_path.clone(),
            self.config_path.clone(),
            self.artifacts_dir.clone(),
            self.logs_dir.clone(),
            self.outputs_dir.clone(),
        ]
    }

    pub fn step_logs(&self, step_id: &str) -> PathBuf {
        self.logs_dir.join("steps").join(step_id)
    }

    pub fn gate_logs(&self, gate_id: &str) -> PathBuf {
        self.logs_dir.join("gates").join(gate_id)
    }

    pub fn step_outputs(&self, step_id: &str, attempt_dir: &Path) -> PathBuf {
        let n = attempt_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.outputs_dir.join(step_id).join(n)
    }

    /// Path relative to the run root, for records that must survive a move.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Make a run root absolute so child processes see the same paths from any
/// working directory.
pub fn absolute_root(root: &Path) -> Result<PathBuf> {
    std::path::absolute(root).with_context(|| format!("resolve run root {}", root.display()))
}

/// Create and return the next free numbered attempt directory under `parent`.
///
/// Numbering starts at 1 and continues past the highest existing entry, so
/// replays never reuse a log directory.
pub fn next_attempt_dir(parent: &Path) -> Result<PathBuf> {
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let mut highest = 0u32;
    for entry in fs::read_dir(parent).with_context(|| format!("read {}", parent.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", parent.display()))?;
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            highest = highest.max(n);
        }
    }
    let mut n = highest + 1;
    loop {
        let dir = parent.join(n.to_string());
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(err) => return Err(err).with_context(|| format!("create {}", dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path());
        assert!(paths.state_path.ends_with("run_state.json"));
        assert!(paths.step_logs("build").ends_with(Path::new("logs/steps/build")));
        assert!(paths.gate_logs("lint").ends_with(Path::new("logs/gates/lint")));
        assert!(paths.default_workspace().ends_with("workspace"));
        assert_eq!(
            paths.relative(&paths.step_logs("build").join("1").join("stdout")),
            "logs/steps/build/1/stdout"
        );
        let managed = paths.managed_paths();
        assert!(managed.contains(&paths.logs_dir));
        assert!(managed.contains(&paths.state_path));
        assert!(!managed.contains(&paths.default_workspace()));
    }

    #[test]
    fn attempt_dirs_continue_past_existing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let parent = temp.path().join("logs");
        assert!(next_attempt_dir(&parent).expect("dir").ends_with("1"));
        assert!(next_attempt_dir(&parent).expect("dir").ends_with("2"));
        fs::create_dir_all(parent.join("7")).expect("mkdir");
        fs::create_dir_all(parent.join("notes")).expect("mkdir");
        assert!(next_attempt_dir(&parent).expect("dir").ends_with("8"));
    }

    #[test]
    fn relative_roots_become_absolute() {
        let root = absolute_root(Path::new("runs/r1")).expect("absolute");
        assert!(root.is_absolute());
        assert!(root.ends_with("runs/r1"));
    }
}
