//! Graph file loading: schema conformance first, then structural validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use crate::core::graph::{ValidatedGraph, validate_graph};
use crate::core::spec::GraphSpec;
use crate::io::schema_registry::{GRAPH_SPEC_SCHEMA, SchemaRegistry};

/// Serialization of a graph file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Json,
    Toml,
}

impl GraphFormat {
    /// `.toml` files are TOML; everything else is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => GraphFormat::Toml,
            _ => GraphFormat::Json,
        }
    }
}

/// Parse a graph document and check it against `graph_spec.v1`.
pub fn parse_graph(raw: &str, format: GraphFormat, registry: &SchemaRegistry) -> Result<GraphSpec> {
    let value: Value = match format {
        GraphFormat::Json => serde_json::from_str(raw).context("parse graph json")?,
        GraphFormat::Toml => toml::from_str(raw).context("parse graph toml")?,
    };
    registry
        .validate(GRAPH_SPEC_SCHEMA, &value)
        .context("graph does not match graph_spec.v1")?;
    serde_json::from_value(value).context("deserialize graph")
}

/// Load, schema-check and validate a graph file.
///
/// Structural failures surface as [`crate::core::graph::GraphError`] inside
/// the returned error chain.
pub fn load_graph(path: &Path, registry: &SchemaRegistry) -> Result<ValidatedGraph> {
    debug!(path = %path.display(), "loading graph");
    let raw = fs::read_to_string(path).with_context(|| format!("read graph {}", path.display()))?;
    let spec = parse_graph(&raw, GraphFormat::from_path(path), registry)
        .with_context(|| format!("load graph {}", path.display()))?;
    let graph = validate_graph(spec).with_context(|| format!("validate graph {}", path.display()))?;
    debug!(
        graph_id = %graph.spec().graph_id,
        steps = graph.topo_order().len(),
        "graph validated"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::GraphError;

    const CHAIN_JSON: &str = r#"{
        "graph_id": "demo",
        "steps": [
            {"step_id": "b", "depends_on": ["a"], "executor": {"kind": "local_command", "argv": ["true"]}},
            {"step_id": "a", "executor": {"kind": "local_command", "argv": ["true"]},
             "retry_policy": {"max_retries": 2}}
        ],
        "routing_rules": [
            {"rule_id": "esc", "when": {"gate_outcome": "failed"}, "action": {"kind": "escalate"}}
        ]
    }"#;

    const CHAIN_TOML: &str = r#"
graph_id = "demo"

[[steps]]
step_id = "a"
executor = { kind = "local_command", argv = ["true"] }

[[steps]]
step_id = "b"
depends_on = ["a"]
executor = { kind = "local_command", argv = ["sh", "-c", "echo hi"] }

[[steps.gates]]
gate_id = "shape"
runner = { kind = "schema_check", schema_id = "report.v1" }
required = false
"#;

    #[test]
    fn loads_json_graph() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("graph.json");
        fs::write(&path, CHAIN_JSON).expect("write");
        let registry = SchemaRegistry::with_builtins().expect("registry");
        let graph = load_graph(&path, &registry).expect("load");
        assert_eq!(graph.topo_order(), ["a", "b"]);
        assert_eq!(graph.step("a").expect("a").retry_policy.max_retries, 2);
    }

    #[test]
    fn loads_toml_graph() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("graph.toml");
        fs::write(&path, CHAIN_TOML).expect("write");
        let registry = SchemaRegistry::with_builtins().expect("registry");
        let graph = load_graph(&path, &registry).expect("load");
        let b = graph.step("b").expect("b");
        assert_eq!(b.gates.len(), 1);
        assert!(!b.gates[0].required);
    }

    #[test]
    fn schema_violations_are_rejected() {
        let registry = SchemaRegistry::with_builtins().expect("registry");
        let raw = r#"{"graph_id": "g", "steps": [{"step_id": "a"}]}"#;
        let err = parse_graph(raw, GraphFormat::Json, &registry).unwrap_err();
        assert!(format!("{err:#}").contains("graph_spec.v1"));
    }

    #[test]
    fn cycles_surface_as_graph_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("graph.json");
        fs::write(
            &path,
            r#"{"graph_id": "g", "steps": [
                {"step_id": "a", "depends_on": ["b"], "executor": {"kind": "local_command", "argv": ["true"]}},
                {"step_id": "b", "depends_on": ["a"], "executor": {"kind": "local_command", "argv": ["true"]}}
            ]}"#,
        )
        .expect("write");
        let registry = SchemaRegistry::with_builtins().expect("registry");
        let err = load_graph(&path, &registry).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::Cycle(_))
        ));
    }
}
