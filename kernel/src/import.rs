//! Importing external files into a run's artifact store.
//!
//! Imported artifacts are what graphs reference through `input_artifact_ids`
//! and gate `artifact_ids`, and what `replace_artifact` swaps in.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, instrument};

use crate::io::artifact_store::{ArtifactMeta, ArtifactStore, NewArtifact};
use crate::io::clock;
use crate::io::executor::Executor;
use crate::io::layout::RunPaths;
use crate::runner::Runner;

/// Producer label for imported artifacts.
pub const IMPORT_PRODUCER: &str = "import";

impl<E: Executor> Runner<E> {
    /// Store `path` under `run_root`. The run does not need to exist yet.
    ///
    /// With `schema_id`, the file must be JSON valid against that schema.
    /// `name` defaults to the file name.
    #[instrument(skip_all, fields(run_root = %run_root.display(), path = %path.display()))]
    pub fn import_file(
        &self,
        run_root: &Path,
        path: &Path,
        name: Option<&str>,
        schema_id: Option<&str>,
    ) -> Result<ArtifactMeta> {
        let paths = RunPaths::new(run_root);
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        if let Some(schema_id) = schema_id {
            let config = self.load_config(&paths)?;
            let registry = self.registry(&paths, &config)?;
            let doc: Value = serde_json::from_slice(&bytes)
                .with_context(|| format!("parse {} as json", path.display()))?;
            registry
                .validate(schema_id, &doc)
                .with_context(|| format!("import {}", path.display()))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = name.unwrap_or(&file_name);
        let store = ArtifactStore::open(&paths.artifacts_dir)?;
        let meta = store.put_bytes(
            &bytes,
            NewArtifact {
                producer: IMPORT_PRODUCER,
                name: Some(name),
                schema_id,
                created_at: &clock::now(),
            },
        )?;
        info!(artifact_id = %meta.artifact_id, name, "imported artifact");
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedExecutor;
    use serde_json::json;

    #[test]
    fn import_is_idempotent_and_named_after_the_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("notes.txt");
        fs::write(&file, "hello").expect("write");
        let runner = Runner::new(ScriptedExecutor::new());
        let run_root = temp.path().join("run");

        let first = runner.import_file(&run_root, &file, None, None).expect("import");
        let second = runner.import_file(&run_root, &file, None, None).expect("import");
        assert_eq!(first.artifact_id, second.artifact_id);
        assert_eq!(first.name.as_deref(), Some("notes.txt"));
        assert_eq!(first.producer, IMPORT_PRODUCER);
    }

    #[test]
    fn schema_checked_import_rejects_invalid_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("report.json");
        fs::write(&file, r#"{"grade": "A"}"#).expect("write");
        let mut runner = Runner::new(ScriptedExecutor::new());
        runner
            .register_schema("report.v1", json!({"type": "object", "required": ["score"]}))
            .expect("register");

        let run_root = temp.path().join("run");
        assert!(runner.import_file(&run_root, &file, None, Some("report.v1")).is_err());
        assert!(runner.import_file(&run_root, &file, None, None).is_ok());
    }
}
