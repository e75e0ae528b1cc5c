//! Deterministic selection of the next step to run.

use crate::core::graph::ValidatedGraph;
use crate::core::types::{RunState, StepStatus};

/// A step is eligible iff it is `pending` and every dependency `succeeded`.
pub fn is_eligible(graph: &ValidatedGraph, state: &RunState, step_id: &str) -> bool {
    let Some(step) = graph.step(step_id) else {
        return false;
    };
    if state.step_status(step_id) != Some(StepStatus::Pending) {
        return false;
    }
    step.depends_on
        .iter()
        .all(|dep| state.step_status(dep) == Some(StepStatus::Succeeded))
}

/// All eligible steps, in schedule order.
pub fn eligible_steps<'a>(graph: &'a ValidatedGraph, state: &RunState) -> Vec<&'a str> {
    graph
        .topo_order()
        .iter()
        .filter(|id| is_eligible(graph, state, id))
        .map(String::as_str)
        .collect()
}

/// The first eligible step in topological order (ties already broken by id).
///
/// Returns `None` when nothing can run. The same graph and state always yield
/// the same answer.
pub fn next_eligible<'a>(graph: &'a ValidatedGraph, state: &RunState) -> Option<&'a str> {
    graph
        .topo_order()
        .iter()
        .find(|id| is_eligible(graph, state, id))
        .map(String::as_str)
}

/// Why scheduling stopped when no step is eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quiescence {
    /// Every step succeeded; run gates are next.
    AllSucceeded,
    /// Some steps are still pending behind unmet dependencies.
    PendingUnreachable(Vec<String>),
    /// Nothing is pending and at least one step failed or was skipped.
    Failed(Vec<String>),
}

/// Classify a state in which [`next_eligible`] returned `None`.
pub fn classify_quiescent(graph: &ValidatedGraph, state: &RunState) -> Quiescence {
    let mut pending = Vec::new();
    let mut unsuccessful = Vec::new();
    for id in graph.topo_order() {
        match state.step_status(id) {
            Some(StepStatus::Succeeded) => {}
            Some(StepStatus::Pending | StepStatus::Running) | None => pending.push(id.clone()),
            Some(StepStatus::Failed | StepStatus::Skipped) => unsuccessful.push(id.clone()),
        }
    }
    if !pending.is_empty() {
        return Quiescence::PendingUnreachable(pending);
    }
    if !unsuccessful.is_empty() {
        return Quiescence::Failed(unsuccessful);
    }
    Quiescence::AllSucceeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::validate_graph;
    use crate::test_support::{graph, step};

    fn diamond() -> ValidatedGraph {
        validate_graph(graph(vec![
            step("a", &[]),
            step("c", &["a"]),
            step("b", &["a"]),
            step("d", &["b", "c"]),
        ]))
        .expect("valid graph")
    }

    #[test]
    fn picks_root_first_then_ties_by_id() {
        let g = diamond();
        let mut state = RunState::new("r", &g, "t0");
        assert_eq!(next_eligible(&g, &state), Some("a"));

        state.step_records.get_mut("a").expect("a").status = StepStatus::Succeeded;
        assert_eq!(eligible_steps(&g, &state), vec!["b", "c"]);
        assert_eq!(next_eligible(&g, &state), Some("b"));
    }

    #[test]
    fn selection_is_repeatable() {
        let g = diamond();
        let mut state = RunState::new("r", &g, "t0");
        state.step_records.get_mut("a").expect("a").status = StepStatus::Succeeded;
        let first = next_eligible(&g, &state);
        for _ in 0..10 {
            assert_eq!(next_eligible(&g, &state), first);
        }
    }

    #[test]
    fn blocked_dependents_are_not_eligible() {
        let g = diamond();
        let mut state = RunState::new("r", &g, "t0");
        state.step_records.get_mut("a").expect("a").status = StepStatus::Failed;
        assert_eq!(next_eligible(&g, &state), None);
        assert_eq!(
            classify_quiescent(&g, &state),
            Quiescence::PendingUnreachable(vec![
                "b".to_string(),
                "c".to_string(),
                "d".to_string()
            ])
        );
    }

    #[test]
    fn quiescent_states_are_classified() {
        let g = diamond();
        let mut state = RunState::new("r", &g, "t0");
        for record in state.step_records.values_mut() {
            record.status = StepStatus::Succeeded;
        }
        assert_eq!(classify_quiescent(&g, &state), Quiescence::AllSucceeded);

        state.step_records.get_mut("d").expect("d").status = StepStatus::Skipped;
        assert_eq!(
            classify_quiescent(&g, &state),
            Quiescence::Failed(vec!["d".to_string()])
        );
    }
}
