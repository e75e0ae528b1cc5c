//! Gate dry runs against already-produced artifacts.
//!
//! Useful after editing a gate command or registering a new schema: the gates
//! run again, their results are stored as usual, and `run_state.json` is left
//! exactly as it was.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::types::{GateStatus, StepStatus};
use crate::io::executor::Executor;
use crate::io::gates::{GateRequest, GateRun};
use crate::runner::Runner;

/// One gate evaluated by a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunGate {
    pub gate_id: String,
    /// `None` for run gates.
    pub step_id: Option<String>,
    pub status: GateStatus,
    pub required: bool,
    pub reason: Option<String>,
    pub result_id: String,
}

impl From<GateRun> for DryRunGate {
    fn from(run: GateRun) -> Self {
        Self {
            gate_id: run.result.gate_id,
            step_id: run.result.step_id,
            status: run.result.status,
            required: run.result.required,
            reason: run.result.reason,
            result_id: run.result_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub gates: Vec<DryRunGate>,
    /// Steps whose gates were not evaluated because the step has not succeeded.
    pub skipped_steps: Vec<String>,
    /// Whether run gates were evaluated (every step succeeded).
    pub run_gates_evaluated: bool,
}

impl DryRunReport {
    /// True when no required gate failed.
    pub fn passed(&self) -> bool {
        !self
            .gates
            .iter()
            .any(|g| g.required && g.status == GateStatus::Failed)
    }
}

impl<E: Executor> Runner<E> {
    /// Re-run the gates of every succeeded step (and the run gates once every
    /// step has succeeded) without executing steps or touching `RunState`.
    #[instrument(skip_all, fields(run_root = %run_root.display()))]
    pub fn dry_run_gates(&self, run_root: &Path) -> Result<DryRunReport> {
        let session = self.open(run_root)?;
        let engine = session.gate_engine();
        let mut report = DryRunReport::default();

        for step in session.graph.steps_in_order() {
            let Some(record) = session.state.step_records.get(&step.step_id) else {
                continue;
            };
            if record.status != StepStatus::Succeeded {
                report.skipped_steps.push(step.step_id.clone());
                continue;
            }
            let network_access = session.policy_for(&step.step_id).network_access;
            for gate in &step.gates {
                let request = GateRequest::for_step(
                    gate,
                    &step.step_id,
                    record.attempts,
                    &record.produced_artifact_ids,
                    network_access,
                );
                report.gates.push(engine.run(&session.state, &request)?.into());
            }
        }

        if report.skipped_steps.is_empty() {
            report.run_gates_evaluated = true;
            let network_access = session.graph.spec().safety_policy.network_access;
            for gate in &session.graph.spec().run_gates {
                let request = GateRequest::for_run(gate, network_access);
                report.gates.push(engine.run(&session.state, &request)?.into());
            }
        }

        info!(
            gates = report.gates.len(),
            skipped = report.skipped_steps.len(),
            passed = report.passed(),
            "dry run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::validate_graph;
    use crate::io::run_state::load_run_state;
    use crate::test_support::{ScriptedExecutor, command_gate, graph, step};

    #[test]
    fn dry_run_reruns_gates_without_touching_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut a = step("a", &[]);
        a.gates.push(command_gate("check-a", &["check"]));
        let mut spec = graph(vec![a, step("b", &["a"])]);
        spec.run_gates.push(command_gate("final", &["final"]));
        let g = validate_graph(spec).expect("graph");

        let runner = Runner::new(ScriptedExecutor::new());
        runner.start(&g, "run-1", temp.path()).expect("start");
        let state_path = temp.path().join("run_state.json");
        let before = load_run_state(&state_path).expect("state");

        runner.executor().push_failure("gate:final", "regressed");
        let report = runner.dry_run_gates(temp.path()).expect("dry run");
        assert!(report.run_gates_evaluated);
        assert_eq!(report.gates.len(), 2);
        assert_eq!(report.gates[0].step_id.as_deref(), Some("a"));
        assert_eq!(report.gates[1].status, GateStatus::Failed);
        assert!(!report.passed());
        assert_eq!(load_run_state(&state_path).expect("state"), before);
    }

    #[test]
    fn unfinished_steps_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = graph(vec![step("a", &[]), step("b", &["a"])]);
        spec.run_gates.push(command_gate("final", &["final"]));
        let g = validate_graph(spec).expect("graph");

        let runner = Runner::new(ScriptedExecutor::new());
        runner.executor().push_failure("step:b", "broken");
        runner.start(&g, "run-1", temp.path()).expect("start");

        let report = runner.dry_run_gates(temp.path()).expect("dry run");
        assert_eq!(report.skipped_steps, ["b"]);
        assert!(!report.run_gates_evaluated);
        assert!(report.gates.is_empty());
        assert!(report.passed());
    }
}
