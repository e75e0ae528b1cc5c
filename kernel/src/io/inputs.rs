//! Input manifests (`inputs.json`) handed to steps and gates.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::core::types::RunState;
use crate::io::artifact_store::{ArtifactStore, StoreError};
use crate::io::atomic::{to_json_bytes, write_atomic};

/// One resolved input artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputEntry {
    pub artifact_id: String,
    /// Id originally requested, when a replacement redirected it.
    pub replaces: Option<String>,
    pub path: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub producer: String,
    pub name: Option<String>,
    pub schema_id: Option<String>,
}

/// Everything a unit was asked to read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputManifest {
    pub entries: Vec<InputEntry>,
    /// Requested ids that could not be resolved, with the reason.
    pub missing: Vec<String>,
}

impl InputManifest {
    pub fn artifact_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.artifact_id.clone()).collect()
    }

    /// Resolve `requested` ids (following replacements) against the store.
    ///
    /// Duplicates are dropped, first occurrence wins. Only IO failures are errors;
    /// unknown or corrupt artifacts land in `missing`.
    pub fn resolve(store: &ArtifactStore, state: &RunState, requested: &[String]) -> Result<Self> {
        let mut manifest = Self::default();
        let mut seen = BTreeSet::new();
        for id in requested {
            let resolved = state.resolve_artifact_id(id);
            if !seen.insert(resolved.clone()) {
                continue;
            }
            match store.meta(&resolved) {
                Ok(meta) => manifest.entries.push(InputEntry {
                    replaces: (resolved != *id).then(|| id.clone()),
                    path: store.blob_path(&meta.artifact_id).display().to_string(),
                    artifact_id: meta.artifact_id,
                    content_hash: meta.content_hash,
                    size_bytes: meta.size_bytes,
                    producer: meta.producer,
                    name: meta.name,
                    schema_id: meta.schema_id,
                }),
                Err(err @ StoreError::Io { .. }) => return Err(err.into()),
                Err(err) => manifest.missing.push(err.to_string()),
            }
        }
        Ok(manifest)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &to_json_bytes(self)?)
    }
}
