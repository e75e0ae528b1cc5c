//! Content-addressed, append-only artifact store.
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/<artifact_id>        immutable bytes
//! meta/<artifact_id>.json    ArtifactMeta
//! ```
//!
//! An artifact id is derived from the producer, the name and the content hash,
//! so storing the same bytes under the same producer and name is idempotent.
//! Blobs are published before their metadata; a meta file therefore implies a
//! complete blob. Nothing here ever rewrites or deletes a published file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::io::atomic::{to_json_bytes, write_new};
use crate::io::schema_registry::SchemaRegistry;

pub const ARTIFACT_ID_PREFIX: &str = "art_";
const ID_HEX_LEN: usize = 32;

/// Metadata stored next to every blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub artifact_id: String,
    /// sha256 of the blob, lowercase hex.
    pub content_hash: String,
    pub size_bytes: u64,
    /// `step:<id>`, `gate:<id>`, `kernel` or `import`.
    pub producer: String,
    pub created_at: String,
    pub name: Option<String>,
    pub schema_id: Option<String>,
}

/// Typed wrapper stored as a JSON artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_id: String,
    pub producer: String,
    pub input_artifact_ids: Vec<String>,
    /// sha256 of the compact JSON encoding of `payload`.
    pub payload_hash: String,
    pub timestamp: String,
    pub payload: Value,
}

impl Envelope {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("decode {} payload", self.schema_id))
    }
}

/// Lookup failures callers may want to branch on.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact '{0}' not found")]
    NotFound(String),
    #[error("'{0}' is not a valid artifact id")]
    InvalidId(String),
    #[error("artifact '{id}' is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("artifact store io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What to record about a new artifact besides its bytes.
#[derive(Debug, Clone, Copy)]
pub struct NewArtifact<'a> {
    pub producer: &'a str,
    pub name: Option<&'a str>,
    pub schema_id: Option<&'a str>,
    pub created_at: &'a str,
}

/// Store rooted at `<run_root>/artifacts`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) a store.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [root.join("blobs"), root.join("meta")] {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, artifact_id: &str) -> PathBuf {
        self.root.join("blobs").join(artifact_id)
    }

    fn meta_path(&self, artifact_id: &str) -> PathBuf {
        self.root.join("meta").join(format!("{artifact_id}.json"))
    }

    /// Store bytes and return their metadata. Idempotent for identical input.
    pub fn put_bytes(&self, bytes: &[u8], new: NewArtifact<'_>) -> Result<ArtifactMeta> {
        let content_hash = sha256_hex(bytes);
        let artifact_id = artifact_id(new.producer, new.name.unwrap_or(""), &content_hash);
        if let Ok(existing) = self.meta(&artifact_id) {
            debug!(artifact_id, "artifact already stored");
            return Ok(existing);
        }

        let meta = ArtifactMeta {
            artifact_id: artifact_id.clone(),
            content_hash,
            size_bytes: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            producer: new.producer.to_string(),
            created_at: new.created_at.to_string(),
            name: new.name.map(str::to_string),
            schema_id: new.schema_id.map(str::to_string),
        };
        write_new(&self.blob_path(&artifact_id), bytes)
            .with_context(|| format!("store blob {artifact_id}"))?;
        if !write_new(&self.meta_path(&artifact_id), &to_json_bytes(&meta)?)
            .with_context(|| format!("store meta {artifact_id}"))?
        {
            // Another writer published the same id first; theirs is canonical.
            return Ok(self.meta(&artifact_id)?);
        }
        debug!(artifact_id, producer = new.producer, size = meta.size_bytes, "stored artifact");
        Ok(meta)
    }

    /// Store a file's contents.
    pub fn put_file(&self, path: &Path, new: NewArtifact<'_>) -> Result<ArtifactMeta> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        self.put_bytes(&bytes, new)
    }

    /// Validate `payload` against `schema_id` and store it as an envelope.
    pub fn put_envelope<T: Serialize>(
        &self,
        registry: &SchemaRegistry,
        schema_id: &str,
        producer: &str,
        input_artifact_ids: &[String],
        payload: &T,
        timestamp: &str,
    ) -> Result<ArtifactMeta> {
        let payload = serde_json::to_value(payload)
            .with_context(|| format!("serialize {schema_id} payload"))?;
        registry
            .validate(schema_id, &payload)
            .with_context(|| format!("envelope from {producer}"))?;
        let compact = serde_json::to_vec(&payload).context("encode payload")?;
        let envelope = Envelope {
            schema_id: schema_id.to_string(),
            producer: producer.to_string(),
            input_artifact_ids: input_artifact_ids.to_vec(),
            payload_hash: sha256_hex(&compact),
            timestamp: timestamp.to_string(),
            payload,
        };
        self.put_bytes(
            &to_json_bytes(&envelope)?,
            NewArtifact {
                producer,
                name: Some(schema_id),
                schema_id: Some(schema_id),
                created_at: timestamp,
            },
        )
    }

    /// Metadata for an artifact.
    pub fn meta(&self, artifact_id: &str) -> Result<ArtifactMeta, StoreError> {
        check_id(artifact_id)?;
        let path = self.meta_path(artifact_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(artifact_id.to_string()));
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
            id: artifact_id.to_string(),
            reason: format!("meta: {err}"),
        })
    }

    pub fn contains(&self, artifact_id: &str) -> bool {
        self.meta(artifact_id).is_ok()
    }

    /// Blob bytes, verified against the recorded hash.
    pub fn read(&self, artifact_id: &str) -> Result<Vec<u8>, StoreError> {
        let meta = self.meta(artifact_id)?;
        let path = self.blob_path(artifact_id);
        let bytes = fs::read(&path).map_err(|source| StoreError::Io { path, source })?;
        let actual = sha256_hex(&bytes);
        if actual != meta.content_hash {
            return Err(StoreError::Corrupt {
                id: artifact_id.to_string(),
                reason: format!("hash {actual} != recorded {}", meta.content_hash),
            });
        }
        Ok(bytes)
    }

    /// Parse an envelope artifact.
    pub fn read_envelope(&self, artifact_id: &str) -> Result<Envelope> {
        let bytes = self.read(artifact_id)?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse envelope {artifact_id}"))
    }

    /// Metadata of every stored artifact, ordered by id.
    pub fn list(&self) -> Result<Vec<ArtifactMeta>> {
        let dir = self.root.join("meta");
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json")
                && is_artifact_id(id)
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        ids.iter()
            .map(|id| self.meta(id).map_err(anyhow::Error::from))
            .collect()
    }
}

/// `art_` + the first 32 hex chars of sha256(producer \0 name \0 content_hash).
pub fn artifact_id(producer: &str, name: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(producer.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{ARTIFACT_ID_PREFIX}{}", &digest[..ID_HEX_LEN])
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn is_artifact_id(id: &str) -> bool {
    id.strip_prefix(ARTIFACT_ID_PREFIX).is_some_and(|rest| {
        rest.len() == ID_HEX_LEN && rest.bytes().all(|b| b.is_ascii_hexdigit())
    })
}

fn check_id(id: &str) -> Result<(), StoreError> {
    if is_artifact_id(id) {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
