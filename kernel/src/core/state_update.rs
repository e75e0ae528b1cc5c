//! Runner-owned state transitions.
//!
//! Every mutation of [`RunState`] the scheduling loop performs goes through
//! these functions, so resume, replay and routing share one set of rules.

use crate::core::graph::ValidatedGraph;
use crate::core::routing::{RoutingContext, describe_failure};
use crate::core::spec::RoutingAction;
use crate::core::types::{RunState, RunStatus, StepStatus};

pub const INTERRUPTED: &str = "interrupted";

/// What the runner should do after an action has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Keep scheduling.
    Continue,
    /// The step went back to `pending` for another attempt.
    Retry,
    /// The target's closure was reset; keep scheduling.
    Goto(String),
    /// Run is `blocked`.
    Blocked(String),
    /// Run is `failed`.
    Aborted(String),
}

/// `attempts` counts executions so far; `max_retries` bounds re-executions.
pub fn retries_exhausted(attempts: u32, max_retries: u32) -> bool {
    attempts > max_retries
}

/// Mark a step `running` and count the attempt. Returns the new attempt number.
pub fn begin_attempt(state: &mut RunState, step_id: &str, now: &str) -> u32 {
    state.status = RunStatus::Running;
    state.status_reason = None;
    state.current_step_id = Some(step_id.to_string());
    state.step_executions += 1;
    state.updated_at = now.to_string();
    let record = state.step_records.entry(step_id.to_string()).or_default();
    record.status = StepStatus::Running;
    record.attempts += 1;
    record.started_at = Some(now.to_string());
    record.finished_at = None;
    record.last_error = None;
    record.produced_artifact_ids.clear();
    record.output_artifact_hashes.clear();
    record.attempts
}

/// Reclassify every `running` step as `failed` with `last_error = "interrupted"`.
///
/// Returns the affected step ids in id order. A second call is a no-op.
pub fn recover_interrupted(state: &mut RunState, now: &str) -> Vec<String> {
    let mut recovered = Vec::new();
    for (id, record) in &mut state.step_records {
        if record.status == StepStatus::Running {
            record.status = StepStatus::Failed;
            record.last_error = Some(INTERRUPTED.to_string());
            record.finished_at = Some(now.to_string());
            recovered.push(id.clone());
        }
    }
    if !recovered.is_empty() {
        state.current_step_id = None;
        state.updated_at = now.to_string();
    }
    recovered
}

/// Reset steps to `pending`. Produced artifact ids are cleared; logs, gate
/// results and violations stay as history. Replay resets attempt counters,
/// `goto_step` keeps them.
pub fn reset_steps(state: &mut RunState, step_ids: &[String], keep_attempts: bool, now: &str) {
    for id in step_ids {
        let record = state.step_records.entry(id.clone()).or_default();
        record.status = StepStatus::Pending;
        if !keep_attempts {
            record.attempts = 0;
        }
        record.started_at = None;
        record.finished_at = None;
        record.last_error = None;
        record.produced_artifact_ids.clear();
        record.output_artifact_hashes.clear();
        record.duration_ms = None;
    }
    state.updated_at = now.to_string();
}

/// Mark steps `skipped`, leaving finished steps alone.
pub fn mark_skipped(state: &mut RunState, step_ids: &[String], reason: &str, now: &str) {
    for id in step_ids {
        if let Some(record) = state.step_records.get_mut(id)
            && matches!(record.status, StepStatus::Pending | StepStatus::Running)
        {
            record.status = StepStatus::Skipped;
            record.last_error = Some(reason.to_string());
            record.finished_at = Some(now.to_string());
        }
    }
}

/// Apply a routing action to the step that just finished.
///
/// `retry_step` is only honoured while retries remain; `continue` after a
/// failure skips everything downstream of the failed step.
pub fn apply_step_action(
    graph: &ValidatedGraph,
    state: &mut RunState,
    ctx: &RoutingContext,
    action: &RoutingAction,
    now: &str,
) -> Applied {
    let Some(step_id) = ctx.step_id.clone() else {
        return apply_run_action(graph, state, ctx, action, now);
    };
    let failed = ctx.is_failure();
    state.current_step_id = None;
    state.updated_at = now.to_string();

    let applied = match action {
        RoutingAction::RetryStep if !ctx.retries_exhausted => {
            set_step_status(state, &step_id, StepStatus::Pending, now);
            return Applied::Retry;
        }
        RoutingAction::RetryStep => Applied::Aborted(describe_failure(ctx)),
        RoutingAction::GotoStep { target } => {
            record_outcome(state, &step_id, failed, now);
            let closure = graph.downstream_closure(target);
            reset_steps(state, &closure, true, now);
            return Applied::Goto(target.clone());
        }
        RoutingAction::Escalate { reason } => {
            // A pause, not a verdict: a failed step waits as `pending` so
            // `resume` runs it again once someone has intervened.
            if failed {
                set_step_status(state, &step_id, StepStatus::Pending, now);
            } else {
                record_outcome(state, &step_id, false, now);
            }
            let applied = Applied::Blocked(
                reason.clone().unwrap_or_else(|| format!("escalated: {}", describe_failure(ctx))),
            );
            finish_run(state, &applied);
            return applied;
        }
        RoutingAction::AbortRun { reason } => {
            Applied::Aborted(reason.clone().unwrap_or_else(|| describe_failure(ctx)))
        }
        RoutingAction::Continue => {
            record_outcome(state, &step_id, failed, now);
            if failed {
                let downstream = graph.strict_downstream(&step_id);
                mark_skipped(
                    state,
                    &downstream,
                    &format!("upstream step '{step_id}' failed"),
                    now,
                );
            }
            return Applied::Continue;
        }
    };

    record_outcome(state, &step_id, failed, now);
    finish_run(state, &applied);
    applied
}

/// Apply a routing action to the outcome of the run gates.
pub fn apply_run_action(
    graph: &ValidatedGraph,
    state: &mut RunState,
    ctx: &RoutingContext,
    action: &RoutingAction,
    now: &str,
) -> Applied {
    state.current_step_id = None;
    state.updated_at = now.to_string();
    let applied = match action {
        RoutingAction::GotoStep { target } => {
            let closure = graph.downstream_closure(target);
            reset_steps(state, &closure, true, now);
            return Applied::Goto(target.clone());
        }
        RoutingAction::RetryStep => Applied::Aborted(describe_failure(ctx)),
        RoutingAction::Escalate { reason } => Applied::Blocked(
            reason.clone().unwrap_or_else(|| format!("escalated: {}", describe_failure(ctx))),
        ),
        RoutingAction::AbortRun { reason } => {
            Applied::Aborted(reason.clone().unwrap_or_else(|| describe_failure(ctx)))
        }
        RoutingAction::Continue if ctx.is_failure() => Applied::Aborted(describe_failure(ctx)),
        RoutingAction::Continue => {
            state.status = RunStatus::Succeeded;
            state.status_reason = None;
            return Applied::Continue;
        }
    };
    finish_run(state, &applied);
    applied
}

fn record_outcome(state: &mut RunState, step_id: &str, failed: bool, now: &str) {
    let status = if failed {
        StepStatus::Failed
    } else {
        StepStatus::Succeeded
    };
    set_step_status(state, step_id, status, now);
}

fn set_step_status(state: &mut RunState, step_id: &str, status: StepStatus, now: &str) {
    let record = state.step_records.entry(step_id.to_string()).or_default();
    record.status = status;
    if status == StepStatus::Pending {
        record.finished_at = None;
    } else {
        record.finished_at = Some(now.to_string());
    }
}

fn finish_run(state: &mut RunState, applied: &Applied) {
    match applied {
        Applied::Blocked(reason) => {
            state.status = RunStatus::Blocked;
            state.status_reason = Some(reason.clone());
        }
        Applied::Aborted(reason) => {
            state.status = RunStatus::Failed;
            state.status_reason = Some(reason.clone());
        }
        Applied::Continue | Applied::Retry | Applied::Goto(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::validate_graph;
    use crate::core::spec::RoutingScope;
    use crate::core::types::Outcome;
    use crate::test_support::{graph, step};

    fn chain() -> ValidatedGraph {
        validate_graph(graph(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
        ]))
        .expect("valid graph")
    }

    fn failed_ctx(step_id: &str, attempts: u32, exhausted: bool) -> RoutingContext {
        RoutingContext {
            scope: RoutingScope::Step,
            step_id: Some(step_id.to_string()),
            step_outcome: Some(Outcome::Failed),
            gate_id: None,
            gate_outcome: None,
            attempts,
            retries_exhausted: exhausted,
            policy_violation: false,
        }
    }

    #[test]
    fn begin_attempt_counts_and_marks_running() {
        let g = chain();
        let mut state = RunState::new("r", &g, "t0");
        assert_eq!(begin_attempt(&mut state, "a", "t1"), 1);
        assert_eq!(begin_attempt(&mut state, "a", "t2"), 2);
        let record = &state.step_records["a"];
        assert_eq!(record.status, StepStatus::Running);
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.step_executions, 2);
        assert_eq!(state.current_step_id.as_deref(), Some("a"));
    }

    #[test]
    fn recover_interrupted_runs_once() {
        let g = chain();
        let mut state = RunState::new("r", &g, "t0");
        begin_attempt(&mut state, "a", "t1");
        assert_eq!(recover_interrupted(&mut state, "t2"), vec!["a".to_string()]);
        let record = &state.step_records["a"];
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some(INTERRUPTED));
        assert_eq!(record.attempts, 1);
        assert!(recover_interrupted(&mut state, "t3").is_empty());
    }

    #[test]
    fn retry_is_honoured_only_while_retries_remain() {
        let g = chain();
        let mut state = RunState::new("r", &g, "t0");
        begin_attempt(&mut state, "b", "t1");
        let applied = apply_step_action(
            &g,
            &mut state,
            &failed_ctx("b", 1, false),
            &RoutingAction::RetryStep,
            "t2",
        );
        assert_eq!(applied, Applied::Retry);
        assert_eq!(state.step_status("b"), Some(StepStatus::Pending));

        begin_attempt(&mut state, "b", "t3");
        let applied = apply_step_action(
            &g,
            &mut state,
            &failed_ctx("b", 2, true),
            &RoutingAction::RetryStep,
            "t4",
        );
        assert!(matches!(applied, Applied::Aborted(_)));
        assert_eq!(state.step_status("b"), Some(StepStatus::Failed));
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[test]
    fn continue_after_failure_skips_downstream() {
        let g = chain();
        let mut state = RunState::new("r", &g, "t0");
        begin_attempt(&mut state, "a", "t1");
        let applied = apply_step_action(
            &g,
            &mut state,
            &failed_ctx("a", 1, true),
            &RoutingAction::Continue,
            "t2",
        );
        assert_eq!(applied, Applied::Continue);
        assert_eq!(state.step_status("a"), Some(StepStatus::Failed));
        assert_eq!(state.step_status("b"), Some(StepStatus::Skipped));
        assert_eq!(state.step_status("c"), Some(StepStatus::Skipped));
    }

    #[test]
    fn goto_resets_target_closure_and_keeps_attempts() {
        let g = chain();
        let mut state = RunState::new("r", &g, "t0");
        for id in ["a", "b"] {
            begin_attempt(&mut state, id, "t1");
            state.step_records.get_mut(id).expect("record").status = StepStatus::Succeeded;
        }
        begin_attempt(&mut state, "c", "t2");
        let applied = apply_step_action(
            &g,
            &mut state,
            &failed_ctx("c", 1, false),
            &RoutingAction::GotoStep {
                target: "b".to_string(),
            },
            "t3",
        );
        assert_eq!(applied, Applied::Goto("b".to_string()));
        assert_eq!(state.step_status("a"), Some(StepStatus::Succeeded));
        assert_eq!(state.step_status("b"), Some(StepStatus::Pending));
        assert_eq!(state.step_status("c"), Some(StepStatus::Pending));
        assert_eq!(state.step_records["b"].attempts, 1);
        assert_eq!(state.step_records["c"].attempts, 1);
    }

    #[test]
    fn escalate_blocks_with_reason() {
        let g = chain();
        let mut state = RunState::new("r", &g, "t0");
        begin_attempt(&mut state, "a", "t1");
        let applied = apply_step_action(
            &g,
            &mut state,
            &failed_ctx("a", 1, false),
            &RoutingAction::Escalate {
                reason: Some("needs a human".to_string()),
            },
            "t2",
        );
        assert_eq!(applied, Applied::Blocked("needs a human".to_string()));
        assert_eq!(state.status, RunStatus::Blocked);
        assert_eq!(state.status_reason.as_deref(), Some("needs a human"));
        assert_eq!(state.step_status("a"), Some(StepStatus::Pending));
        assert_eq!(state.step_records["a"].attempts, 1);
        assert_eq!(state.step_records["a"].finished_at, None);
    }

    #[test]
    fn reset_clears_produced_ids_and_attempts() {
        let g = chain();
        let mut state = RunState::new("r", &g, "t0");
        begin_attempt(&mut state, "a", "t1");
        {
            let record = state.step_records.get_mut("a").expect("a");
            record.status = StepStatus::Succeeded;
            record.produced_artifact_ids.push("art_x".to_string());
            record.log_paths.push("logs/steps/a/1/stdout".to_string());
        }
        reset_steps(&mut state, &["a".to_string()], false, "t2");
        let record = &state.step_records["a"];
        assert_eq!(record.status, StepStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.produced_artifact_ids.is_empty());
        assert_eq!(record.log_paths.len(), 1);
    }

    #[test]
    fn run_scope_continue_on_failure_aborts() {
        let g = chain();
        let mut state = RunState::new("r", &g, "t0");
        let ctx = RoutingContext {
            scope: RoutingScope::Run,
            step_id: None,
            step_outcome: None,
            gate_id: Some("final".to_string()),
            gate_outcome: Some(crate::core::types::GateStatus::Failed),
            attempts: 1,
            retries_exhausted: true,
            policy_violation: false,
        };
        let applied = apply_run_action(&g, &mut state, &ctx, &RoutingAction::Continue, "t1");
        assert!(matches!(applied, Applied::Aborted(_)));
        assert_eq!(state.status, RunStatus::Failed);
    }
}
