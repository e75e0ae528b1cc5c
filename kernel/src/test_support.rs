//! Test-only helpers: graph builders and a scripted executor.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

use crate::core::spec::{
    CommandSpec, ExecutorSpec, GateRunnerSpec, GateSpec, GraphSpec, RetryPolicy, SafetyPolicy,
    StepSpec, TimeoutPolicy,
};
use crate::io::executor::{ExecOutcome, ExecRequest, Executor};

/// Graph with deterministic defaults and no run gates, rules or policy.
pub fn graph(steps: Vec<StepSpec>) -> GraphSpec {
    GraphSpec {
        graph_id: "test-graph".to_string(),
        steps,
        run_gates: Vec::new(),
        routing_rules: Vec::new(),
        safety_policy: SafetyPolicy::default(),
    }
}

/// Step running `true` with the given dependencies and no retries.
pub fn step(id: &str, depends_on: &[&str]) -> StepSpec {
    StepSpec {
        step_id: id.to_string(),
        name: format!("{id} step"),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        input_artifact_ids: Vec::new(),
        output_schema_ids: Vec::new(),
        executor: ExecutorSpec::LocalCommand(command(&["true"])),
        retry_policy: RetryPolicy::default(),
        timeout_policy: TimeoutPolicy::default(),
        gates: Vec::new(),
        safety_policy: None,
    }
}

/// Step with `max_retries` set.
pub fn step_with_retries(id: &str, depends_on: &[&str], max_retries: u32) -> StepSpec {
    let mut step = step(id, depends_on);
    step.retry_policy.max_retries = max_retries;
    step
}

/// Required local-command gate that includes step outputs.
pub fn command_gate(id: &str, argv: &[&str]) -> GateSpec {
    GateSpec {
        gate_id: id.to_string(),
        runner: GateRunnerSpec::LocalCommand(command(argv)),
        artifact_ids: Vec::new(),
        include_step_outputs: true,
        required: true,
        timeout_seconds: None,
    }
}

pub fn command(argv: &[&str]) -> CommandSpec {
    CommandSpec {
        argv: argv.iter().map(|a| a.to_string()).collect(),
        cwd: None,
        env: BTreeMap::new(),
    }
}

/// One scripted execution.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExec {
    pub fail: Option<String>,
    pub timed_out: bool,
    /// Files written relative to the request's working directory.
    pub workspace_writes: Vec<(String, String)>,
    /// Files written into `KERNEL_OUTPUT_DIR`.
    pub outputs: Vec<(String, String)>,
    /// JSON written to `KERNEL_METRICS_FILE`.
    pub metrics: Option<Value>,
}

impl ScriptedExec {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, name: &str, contents: &str) -> Self {
        self.outputs.push((name.to_string(), contents.to_string()));
        self
    }

    pub fn with_workspace_write(mut self, path: &str, contents: &str) -> Self {
        self.workspace_writes
            .push((path.to_string(), contents.to_string()));
        self
    }
}

/// Executor returning queued outcomes per unit (`step:<id>` / `gate:<id>`).
///
/// Units with an empty queue succeed. Every request is recorded.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    queues: Mutex<BTreeMap<String, VecDeque<ScriptedExec>>>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, unit: &str, exec: ScriptedExec) {
        self.queues
            .lock()
            .expect("queue lock")
            .entry(unit.to_string())
            .or_default()
            .push_back(exec);
    }

    pub fn push_failure(&self, unit: &str, message: &str) {
        self.push(unit, ScriptedExec::failure(message));
    }

    pub fn push_metrics(&self, unit: &str, metrics: Value) {
        self.push(
            unit,
            ScriptedExec {
                metrics: Some(metrics),
                ..ScriptedExec::default()
            },
        );
    }

    /// Units executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.unit)
            .collect()
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn count(&self, unit: &str) -> usize {
        self.calls().iter().filter(|u| *u == unit).count()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: &ExecRequest) -> ExecOutcome {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let script = self
            .queues
            .lock()
            .expect("queue lock")
            .get_mut(&request.unit)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        for (rel, contents) in &script.workspace_writes {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("create workspace dir");
            }
            fs::write(&path, contents).expect("write workspace file");
        }
        if let Some(dir) = request.env.get("KERNEL_OUTPUT_DIR") {
            for (name, contents) in &script.outputs {
                let path = PathBuf::from(dir).join(name);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).expect("create output dir");
                }
                fs::write(&path, contents).expect("write output");
            }
        }
        if let (Some(metrics), Some(path)) =
            (&script.metrics, request.env.get("KERNEL_METRICS_FILE"))
        {
            fs::write(path, serde_json::to_vec(metrics).expect("encode metrics"))
                .expect("write metrics");
        }

        fs::create_dir_all(&request.log_dir).expect("create log dir");
        let stdout = request.log_dir.join("stdout");
        let stderr = request.log_dir.join("stderr");
        fs::write(&stdout, format!("scripted {}\n", request.unit)).expect("write stdout");
        fs::write(&stderr, script.fail.clone().unwrap_or_default()).expect("write stderr");

        ExecOutcome {
            success: script.fail.is_none() && !script.timed_out,
            exit_code: if script.timed_out {
                None
            } else if script.fail.is_some() {
                Some(1)
            } else {
                Some(0)
            },
            timed_out: script.timed_out,
            error_message: script
                .fail
                .or_else(|| script.timed_out.then(|| "timed out".to_string())),
            log_paths: vec![stdout, stderr],
            duration_ms: 1,
        }
    }
}
