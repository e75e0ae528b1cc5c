//! Graph model: pure data describing steps, gates, routing rules and safety
//! policies.
//!
//! These types are the input contract of the kernel. Higher-level workflow
//! layers compile into them; the kernel never extends them at run time.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::types::{GateStatus, Outcome};

/// A directed acyclic graph of steps plus run-level gates and policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub graph_id: String,
    pub steps: Vec<StepSpec>,
    /// Gates run once after every step has succeeded.
    #[serde(default)]
    pub run_gates: Vec<GateSpec>,
    /// Ordered routing rules; first match wins.
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    /// Run-wide default policy. Steps may replace it with their own.
    #[serde(default)]
    pub safety_policy: SafetyPolicy,
}

/// Smallest schedulable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub input_artifact_ids: Vec<String>,
    /// Declared output schemas. Not enforced by the runner; attach a
    /// `schema_check` gate to enforce them.
    #[serde(default)]
    pub output_schema_ids: Vec<String>,
    pub executor: ExecutorSpec,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    /// Replaces the graph-level policy for this step when set.
    #[serde(default)]
    pub safety_policy: Option<SafetyPolicy>,
}

impl StepSpec {
    /// Policy in force for this step.
    pub fn effective_policy<'a>(&'a self, graph_default: &'a SafetyPolicy) -> &'a SafetyPolicy {
        self.safety_policy.as_ref().unwrap_or(graph_default)
    }
}

/// How a step is executed. Open sum type keyed by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorSpec {
    LocalCommand(CommandSpec),
}

impl ExecutorSpec {
    /// Stable name of the executor kind (as written in graph files).
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorSpec::LocalCommand(_) => "local_command",
        }
    }
}

/// A local command: argv plus optional working directory and environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    /// Relative paths resolve against the run workspace.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// A verification check attached to a step or to the whole graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    pub gate_id: String,
    pub runner: GateRunnerSpec,
    /// Artifacts the gate always consumes.
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    /// For step gates, also consume the artifacts the step produced.
    #[serde(default = "default_true")]
    pub include_step_outputs: bool,
    /// Failing required gates block progression; optional ones only record.
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// How a gate is evaluated. Open sum type keyed by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateRunnerSpec {
    /// Same local-command abstraction as steps; exit 0 passes.
    LocalCommand(CommandSpec),
    /// Every input artifact must be JSON valid against a registered schema.
    SchemaCheck { schema_id: String },
}

fn default_true() -> bool {
    true
}

/// Write and tool boundaries enforced around a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    /// Workspace-relative prefixes writes may touch. Empty allows any path.
    pub allow_write_paths: Vec<String>,
    /// Workspace-relative prefixes writes must never touch.
    pub deny_write_paths: Vec<String>,
    pub max_diff_size_bytes: Option<u64>,
    /// Executor kinds or command names a step may run. Empty allows any tool.
    pub allowed_tools: Vec<String>,
    pub network_access: NetworkAccess,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkAccess {
    #[default]
    Allow,
    Deny,
}

impl NetworkAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkAccess::Allow => "allow",
            NetworkAccess::Deny => "deny",
        }
    }
}

/// A declarative routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub rule_id: String,
    #[serde(default)]
    pub when: RoutingCondition,
    pub action: RoutingAction,
}

/// Conjunctive field matches. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingCondition {
    pub scope: Option<RoutingScope>,
    pub step_id: Option<String>,
    pub step_outcome: Option<Outcome>,
    pub gate_id: Option<String>,
    pub gate_outcome: Option<GateStatus>,
    pub retries_exhausted: Option<bool>,
    pub policy_violation: Option<bool>,
}

/// Whether an outcome belongs to a single step or to the run gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingScope {
    Step,
    Run,
}

/// What the runner does next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingAction {
    RetryStep,
    GotoStep {
        target: String,
    },
    /// Pause for manual intervention (`blocked`), not a failure.
    Escalate {
        #[serde(default)]
        reason: Option<String>,
    },
    AbortRun {
        #[serde(default)]
        reason: Option<String>,
    },
    Continue,
}
