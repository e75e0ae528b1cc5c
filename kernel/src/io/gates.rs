//! Gate engine: one code path for step gates and run gates.
//!
//! Every evaluation gets a fresh `logs/gates/<gate_id>/<n>` directory, stores
//! its logs as artifacts and always stores a `GateResult` envelope, whether
//! the gate passed, failed, timed out or could not even start.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::ids::gate_producer;
use crate::core::spec::{CommandSpec, GateRunnerSpec, GateSpec, NetworkAccess};
use crate::core::types::{GateResult, GateStatus, RunState};
use crate::io::artifact_store::{ArtifactStore, Envelope, NewArtifact};
use crate::io::atomic::{to_json_bytes, write_atomic};
use crate::io::clock;
use crate::io::config::KernelConfig;
use crate::io::executor::{
    ExecOutcome, ExecRequest, Executor, GATE_SUMMARY_FILE, kernel_env, resolve_workdir,
};
use crate::io::inputs::InputManifest;
use crate::io::layout::{RunPaths, next_attempt_dir};
use crate::io::schema_registry::{GATE_RESULT_SCHEMA, SchemaRegistry};

pub const METRICS_FILE: &str = "metrics.json";

/// Shared context for gate evaluations within one run.
pub struct GateEngine<'a, E> {
    pub executor: &'a E,
    pub paths: &'a RunPaths,
    pub store: &'a ArtifactStore,
    pub registry: &'a SchemaRegistry,
    pub config: &'a KernelConfig,
    pub workspace: &'a Path,
}

/// One gate evaluation.
#[derive(Debug, Clone)]
pub struct GateRequest<'a> {
    pub gate: &'a GateSpec,
    /// Owning step; `None` for run gates.
    pub step_id: Option<&'a str>,
    /// Attempt of the owning step (1 for run gates).
    pub attempt: u32,
    /// Requested input ids before replacement resolution.
    pub input_artifact_ids: Vec<String>,
    pub network_access: NetworkAccess,
}

impl<'a> GateRequest<'a> {
    /// Inputs of a step gate: declared ids, then the step's outputs when included.
    pub fn for_step(
        gate: &'a GateSpec,
        step_id: &'a str,
        attempt: u32,
        produced: &[String],
        network_access: NetworkAccess,
    ) -> Self {
        let mut input_artifact_ids = gate.artifact_ids.clone();
        if gate.include_step_outputs {
            input_artifact_ids.extend(produced.iter().cloned());
        }
        Self {
            gate,
            step_id: Some(step_id),
            attempt,
            input_artifact_ids,
            network_access,
        }
    }

    /// Inputs of a run gate: declared ids only.
    pub fn for_run(gate: &'a GateSpec, network_access: NetworkAccess) -> Self {
        Self {
            gate,
            step_id: None,
            attempt: 1,
            input_artifact_ids: gate.artifact_ids.clone(),
            network_access,
        }
    }
}

/// A stored gate result.
#[derive(Debug, Clone, PartialEq)]
pub struct GateRun {
    pub result: GateResult,
    pub result_id: String,
}

struct Verdict {
    status: GateStatus,
    reason: Option<String>,
    metrics: Option<Value>,
}

impl Verdict {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Failed,
            reason: Some(reason.into()),
            metrics: None,
        }
    }
}

impl<E: Executor> GateEngine<'_, E> {
    /// Evaluate one gate and store its result.
    ///
    /// Errors only on persistence failures; every gate outcome is a value.
    #[instrument(skip_all, fields(gate_id = %request.gate.gate_id, step_id = ?request.step_id))]
    pub fn run(&self, state: &RunState, request: &GateRequest<'_>) -> Result<GateRun> {
        let gate = request.gate;
        let unit = gate_producer(&gate.gate_id);
        let log_dir = next_attempt_dir(&self.paths.gate_logs(&gate.gate_id))?;
        let manifest = InputManifest::resolve(self.store, state, &request.input_artifact_ids)?;
        let inputs_path = log_dir.join("inputs.json");
        manifest.write(&inputs_path)?;

        let verdict = if !manifest.missing.is_empty() {
            Verdict::failed(format!(
                "missing input artifacts: {}",
                manifest.missing.join("; ")
            ))
        } else {
            match &gate.runner {
                GateRunnerSpec::LocalCommand(cmd) => {
                    self.run_command(state, request, cmd, &log_dir, &inputs_path)
                }
                GateRunnerSpec::SchemaCheck { schema_id } => {
                    self.run_schema_check(schema_id, &manifest, &log_dir)?
                }
            }
        };

        let log_artifact_ids = self.store_logs(&unit, &log_dir)?;
        let result = GateResult {
            gate_id: gate.gate_id.clone(),
            step_id: request.step_id.map(str::to_string),
            attempt: request.attempt,
            required: gate.required,
            status: verdict.status,
            reason: verdict.reason,
            log_artifact_ids,
            metrics: verdict.metrics,
            timestamp: clock::now(),
        };
        let meta = self.store.put_envelope(
            self.registry,
            GATE_RESULT_SCHEMA,
            &unit,
            &manifest.artifact_ids(),
            &result,
            &result.timestamp,
        )?;

        match result.status {
            GateStatus::Passed => info!(result_id = %meta.artifact_id, "gate passed"),
            GateStatus::Failed => warn!(
                result_id = %meta.artifact_id,
                required = result.required,
                reason = ?result.reason,
                "gate failed"
            ),
        }
        Ok(GateRun {
            result,
            result_id: meta.artifact_id,
        })
    }

    fn run_command(
        &self,
        state: &RunState,
        request: &GateRequest<'_>,
        cmd: &CommandSpec,
        log_dir: &Path,
        inputs_path: &Path,
    ) -> Verdict {
        let gate = request.gate;
        let metrics_path = log_dir.join(METRICS_FILE);
        let unit = gate_producer(&gate.gate_id);
        let mut env = kernel_env(
            &state.run_id,
            &self.paths.root,
            &unit,
            request.attempt,
            inputs_path,
            request.network_access,
        );
        env.insert(
            "KERNEL_METRICS_FILE".to_string(),
            metrics_path.display().to_string(),
        );
        let timeout = gate
            .timeout_seconds
            .or(self.config.default_gate_timeout_secs)
            .map(Duration::from_secs);
        let exec = ExecRequest {
            unit,
            attempt: request.attempt,
            command: cmd.clone(),
            workdir: resolve_workdir(self.workspace, cmd.cwd.as_deref()),
            log_dir: log_dir.to_path_buf(),
            summary_file: GATE_SUMMARY_FILE,
            timeout,
            output_limit_bytes: self.config.output_limit_bytes,
            env,
        };
        let outcome = self.executor.execute(&exec);
        verdict_from_command(&outcome, &metrics_path)
    }

    fn run_schema_check(
        &self,
        schema_id: &str,
        manifest: &InputManifest,
        log_dir: &Path,
    ) -> Result<Verdict> {
        let mut report = SchemaCheckReport {
            schema_id,
            checked: Vec::new(),
        };
        let verdict = if !self.registry.contains(schema_id) {
            Verdict::failed(format!("unknown schema id '{schema_id}'"))
        } else if manifest.entries.is_empty() {
            Verdict::failed("no input artifacts to check")
        } else {
            let mut failures = Vec::new();
            for entry in &manifest.entries {
                let error = match self.check_artifact(schema_id, &entry.artifact_id) {
                    Ok(()) => None,
                    Err(err) => {
                        failures.push(format!("{}: {err:#}", entry.artifact_id));
                        Some(format!("{err:#}"))
                    }
                };
                report.checked.push(CheckedArtifact {
                    artifact_id: entry.artifact_id.clone(),
                    valid: error.is_none(),
                    error,
                });
            }
            if failures.is_empty() {
                Verdict {
                    status: GateStatus::Passed,
                    reason: None,
                    metrics: None,
                }
            } else {
                Verdict::failed(failures.join("\n"))
            }
        };

        let stdout: String = report
            .checked
            .iter()
            .map(|c| {
                format!(
                    "{} {}\n",
                    if c.valid { "ok  " } else { "FAIL" },
                    c.artifact_id
                )
            })
            .collect();
        let stderr = verdict.reason.clone().unwrap_or_default();
        write_text(&log_dir.join("stdout"), &stdout)?;
        write_text(&log_dir.join("stderr"), &stderr)?;
        write_atomic(&log_dir.join(GATE_SUMMARY_FILE), &to_json_bytes(&report)?)?;
        Ok(verdict)
    }

    /// Envelopes are checked by their payload, anything else as a whole document.
    fn check_artifact(&self, schema_id: &str, artifact_id: &str) -> Result<()> {
        let bytes = self.store.read(artifact_id)?;
        let doc: Value = serde_json::from_slice(&bytes).context("artifact is not JSON")?;
        let instance = match serde_json::from_value::<Envelope>(doc.clone()) {
            Ok(envelope) => envelope.payload,
            Err(_) => doc,
        };
        self.registry.validate(schema_id, &instance)
    }

    /// Store every regular file in the gate's log directory, by file name order.
    fn store_logs(&self, unit: &str, log_dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(log_dir).with_context(|| format!("read {}", log_dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", log_dir.display()))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        let now = clock::now();
        let mut ids = Vec::with_capacity(names.len());
        for name in &names {
            let meta = self.store.put_file(
                &log_dir.join(name),
                NewArtifact {
                    producer: unit,
                    name: Some(name),
                    schema_id: None,
                    created_at: &now,
                },
            )?;
            ids.push(meta.artifact_id);
        }
        Ok(ids)
    }
}

#[derive(Serialize)]
struct SchemaCheckReport<'a> {
    schema_id: &'a str,
    checked: Vec<CheckedArtifact>,
}

#[derive(Serialize)]
struct CheckedArtifact {
    artifact_id: String,
    valid: bool,
    error: Option<String>,
}

fn verdict_from_command(outcome: &ExecOutcome, metrics_path: &Path) -> Verdict {
    let metrics = match fs::read(metrics_path) {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Some(value),
            Err(err) => return Verdict::failed(format!("{METRICS_FILE} is not valid JSON: {err}")),
        },
        Err(_) => None,
    };
    if outcome.success {
        Verdict {
            status: GateStatus::Passed,
            reason: None,
            metrics,
        }
    } else {
        Verdict {
            status: GateStatus::Failed,
            reason: Some(
                outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "gate command failed".to_string()),
            ),
            metrics,
        }
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
