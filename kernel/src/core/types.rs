//! Shared deterministic types for run state and envelope payloads.
//!
//! These types define stable contracts between kernel components and the
//! files other tooling reads. Maps are ordered so serialized output is stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::graph::ValidatedGraph;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Created,
    Running,
    Blocked,
    Failed,
    Succeeded,
}

impl RunStatus {
    /// `failed` and `succeeded` are final; `blocked` awaits intervention.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Succeeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Blocked => "blocked",
            RunStatus::Failed => "failed",
            RunStatus::Succeeded => "succeeded",
        }
    }
}

/// Lifecycle of one step within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Binary outcome of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Result classification of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Passed,
    Failed,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GateStatus::Passed => "passed",
            GateStatus::Failed => "failed",
        }
    }
}

/// Per-step execution bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRunRecord {
    pub status: StepStatus,
    /// Attempts counted against the retry budget.
    pub attempts: u32,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_error: Option<String>,
    /// Artifacts produced by the latest attempt.
    pub produced_artifact_ids: Vec<String>,
    /// Run-root-relative log files, accumulated across attempts.
    pub log_paths: Vec<String>,
    pub input_artifact_hashes: BTreeMap<String, String>,
    pub output_artifact_hashes: BTreeMap<String, String>,
    pub duration_ms: Option<u64>,
    pub gate_result_ids: Vec<String>,
    pub policy_violation_ids: Vec<String>,
}

/// Durable execution state of one run (`run_state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub graph_id: String,
    pub current_step_id: Option<String>,
    pub step_records: BTreeMap<String, StepRunRecord>,
    pub created_at: String,
    pub updated_at: String,
    /// Why the run is blocked or failed.
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub environment_snapshot_id: Option<String>,
    #[serde(default)]
    pub run_gate_result_ids: Vec<String>,
    /// Replaced artifact id -> replacement id.
    #[serde(default)]
    pub artifact_substitutions: BTreeMap<String, String>,
    #[serde(default)]
    pub replacement_ids: Vec<String>,
    /// Total step executions across the lifetime of the run.
    #[serde(default)]
    pub step_executions: u64,
}

impl RunState {
    /// Fresh state with every step `pending`.
    pub fn new(run_id: &str, graph: &ValidatedGraph, now: &str) -> Self {
        let step_records = graph
            .topo_order()
            .iter()
            .map(|id| (id.clone(), StepRunRecord::default()))
            .collect();
        Self {
            run_id: run_id.to_string(),
            status: RunStatus::Created,
            graph_id: graph.spec().graph_id.clone(),
            current_step_id: None,
            step_records,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            status_reason: None,
            environment_snapshot_id: None,
            run_gate_result_ids: Vec::new(),
            artifact_substitutions: BTreeMap::new(),
            replacement_ids: Vec::new(),
            step_executions: 0,
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_records.get(step_id).map(|r| r.status)
    }

    /// Follow replacement links to the artifact id consumers should read.
    pub fn resolve_artifact_id(&self, artifact_id: &str) -> String {
        let mut current = artifact_id;
        // A replacement chain can never be longer than the number of links.
        for _ in 0..=self.artifact_substitutions.len() {
            match self.artifact_substitutions.get(current) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current.to_string()
    }
}

/// Envelope payload for `kernel.gate_result.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    /// `None` for run-level gates.
    pub step_id: Option<String>,
    pub attempt: u32,
    pub required: bool,
    pub status: GateStatus,
    pub reason: Option<String>,
    pub log_artifact_ids: Vec<String>,
    pub metrics: Option<Value>,
    pub timestamp: String,
}

impl GateResult {
    /// True if this result stops progression.
    pub fn blocks(&self) -> bool {
        self.required && self.status == GateStatus::Failed
    }
}

/// Kinds of safety policy violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    ToolNotAllowed,
    WriteOutsideAllowed,
    WriteDenied,
    DiffSizeExceeded,
}

/// Envelope payload for `kernel.policy_violation.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub step_id: String,
    pub violation_type: ViolationType,
    pub details: String,
    pub timestamp: String,
}

/// Envelope payload for `kernel.environment_snapshot.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub kernel_version: String,
    pub os: String,
    pub arch: String,
    pub family: String,
    pub dependency_lock_path: Option<String>,
    pub dependency_lock_hash: Option<String>,
    pub captured_at: String,
}

/// Envelope payload for `kernel.artifact_replacement.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReplacement {
    pub old_artifact_id: String,
    pub new_artifact_id: String,
    pub reason: String,
    /// Steps reset to `pending` by the replacement, in topological order.
    pub reset_step_ids: Vec<String>,
    pub timestamp: String,
}
