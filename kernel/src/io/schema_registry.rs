//! Schema registry: schema id -> compiled JSON Schema validator.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::debug;

pub const GATE_RESULT_SCHEMA: &str = "kernel.gate_result.v1";
pub const POLICY_VIOLATION_SCHEMA: &str = "kernel.policy_violation.v1";
pub const ENVIRONMENT_SNAPSHOT_SCHEMA: &str = "kernel.environment_snapshot.v1";
pub const ARTIFACT_REPLACEMENT_SCHEMA: &str = "kernel.artifact_replacement.v1";
pub const GRAPH_SPEC_SCHEMA: &str = "graph_spec.v1";

const BUILTIN_SCHEMAS: [(&str, &str); 5] = [
    (
        GATE_RESULT_SCHEMA,
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../schemas/kernel.gate_result.v1.schema.json"
        )),
    ),
    (
        POLICY_VIOLATION_SCHEMA,
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../schemas/kernel.policy_violation.v1.schema.json"
        )),
    ),
    (
        ENVIRONMENT_SNAPSHOT_SCHEMA,
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../schemas/kernel.environment_snapshot.v1.schema.json"
        )),
    ),
    (
        ARTIFACT_REPLACEMENT_SCHEMA,
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../schemas/kernel.artifact_replacement.v1.schema.json"
        )),
    ),
    (
        GRAPH_SPEC_SCHEMA,
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../schemas/graph_spec.v1.schema.json"
        )),
    ),
];

const SCHEMA_FILE_SUFFIX: &str = ".schema.json";

/// Compiled validators keyed by schema id.
pub struct SchemaRegistry {
    validators: BTreeMap<String, Validator>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schema_ids", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaRegistry {
    /// Registry with no schemas.
    pub fn empty() -> Self {
        Self {
            validators: BTreeMap::new(),
        }
    }

    /// Registry holding the kernel's own envelope schemas.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::empty();
        for (id, raw) in BUILTIN_SCHEMAS {
            let schema: Value =
                serde_json::from_str(raw).with_context(|| format!("parse builtin schema {id}"))?;
            registry.register(id, &schema)?;
        }
        Ok(registry)
    }

    /// Compile and register a schema. Re-registering an id replaces it.
    pub fn register(&mut self, schema_id: &str, schema: &Value) -> Result<()> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .map_err(|err| anyhow!("compile schema {schema_id}: {err}"))?;
        debug!(schema_id, "registered schema");
        self.validators.insert(schema_id.to_string(), validator);
        Ok(())
    }

    /// Register every `<schema_id>.schema.json` file in `dir` (sorted by name).
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut files = Vec::new();
        let entries =
            fs::read_dir(dir).with_context(|| format!("read schema dir {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(SCHEMA_FILE_SUFFIX) {
                files.push((id.to_string(), entry.path()));
            }
        }
        files.sort();
        for (id, path) in &files {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read schema {}", path.display()))?;
            let schema: Value = serde_json::from_str(&raw)
                .with_context(|| format!("parse schema {}", path.display()))?;
            self.register(id, &schema)?;
        }
        Ok(files.len())
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.validators.contains_key(schema_id)
    }

    /// Validate `instance`; the error lists every violation.
    pub fn validate(&self, schema_id: &str, instance: &Value) -> Result<()> {
        let Some(validator) = self.validators.get(schema_id) else {
            bail!("unknown schema id '{schema_id}'");
        };
        let messages: Vec<String> = validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!(
                "schema '{schema_id}' validation failed:\n- {}",
                messages.join("\n- ")
            );
        }
        Ok(())
    }
}
