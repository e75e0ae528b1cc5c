//! Graph validation and deterministic ordering.
//!
//! A [`GraphSpec`] becomes a [`ValidatedGraph`] only after every structural
//! check passes. The runner accepts nothing else, so a malformed graph is
//! never scheduled, not even partially.

use std::collections::{BTreeMap, BTreeSet, btree_set};

use thiserror::Error;

use crate::core::ids::validate_id;
use crate::core::spec::{ExecutorSpec, GateRunnerSpec, GraphSpec, RoutingAction, StepSpec};

/// Structural problems that make a graph unschedulable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph_id must not be empty")]
    EmptyGraphId,
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("invalid id '{id}': {reason}")]
    InvalidId { id: String, reason: String },
    #[error("{owner}: command argv must not be empty")]
    EmptyArgv { owner: String },
    #[error("duplicate gate id '{0}'")]
    DuplicateGateId(String),
    #[error("routing rule '{rule_id}' targets unknown step '{target}'")]
    UnknownGotoTarget { rule_id: String, target: String },
}

/// A graph that passed validation, with its deterministic schedule order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedGraph {
    spec: GraphSpec,
    order: Vec<String>,
    rank: BTreeMap<String, usize>,
    index: BTreeMap<String, usize>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl ValidatedGraph {
    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    /// Step ids in topological order, ties broken by step id.
    pub fn topo_order(&self) -> &[String] {
        &self.order
    }

    /// Position of a step in [`Self::topo_order`].
    pub fn rank(&self, step_id: &str) -> Option<usize> {
        self.rank.get(step_id).copied()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.index.get(step_id).map(|&i| &self.spec.steps[i])
    }

    /// Steps in topological order.
    pub fn steps_in_order(&self) -> impl Iterator<Item = &StepSpec> {
        self.order.iter().filter_map(|id| self.step(id))
    }

    /// The step and everything transitively downstream of it, in topological order.
    pub fn downstream_closure(&self, step_id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![step_id.to_string()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(children) = self.dependents.get(&id) {
                stack.extend(children.iter().cloned());
            }
        }
        self.order
            .iter()
            .filter(|id| seen.contains(*id))
            .cloned()
            .collect()
    }

    /// Everything transitively downstream of a step, excluding the step itself.
    pub fn strict_downstream(&self, step_id: &str) -> Vec<String> {
        self.downstream_closure(step_id)
            .into_iter()
            .filter(|id| id != step_id)
            .collect()
    }
}

/// Validate a graph. Checks run in a fixed order and the first failure is returned:
///
/// 1. step id uniqueness
/// 2. every `depends_on` resolves
/// 3. no dependency cycle
/// 4. id format, non-empty argv, unique gate ids, resolvable `goto_step` targets
pub fn validate_graph(spec: GraphSpec) -> Result<ValidatedGraph, GraphError> {
    if spec.graph_id.trim().is_empty() {
        return Err(GraphError::EmptyGraphId);
    }

    let mut index = BTreeMap::new();
    for (i, step) in spec.steps.iter().enumerate() {
        if index.insert(step.step_id.clone(), i).is_some() {
            return Err(GraphError::DuplicateStepId(step.step_id.clone()));
        }
    }

    for step in &spec.steps {
        for dep in &step.depends_on {
            if !index.contains_key(dep) {
                return Err(GraphError::UnknownDependency {
                    step_id: step.step_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let deps = dependency_map(&spec);
    if let Some(cycle) = find_cycle(&deps) {
        return Err(GraphError::Cycle(cycle));
    }

    validate_details(&spec, &index)?;

    let dependents = dependents_map(&deps);
    let order = topological_order(&deps, &dependents);
    let rank = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();

    Ok(ValidatedGraph {
        spec,
        order,
        rank,
        index,
        dependents,
    })
}

fn dependency_map(spec: &GraphSpec) -> BTreeMap<String, BTreeSet<String>> {
    spec.steps
        .iter()
        .map(|s| (s.step_id.clone(), s.depends_on.iter().cloned().collect()))
        .collect()
}

fn dependents_map(
    deps: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut dependents: BTreeMap<String, BTreeSet<String>> =
        deps.keys().map(|k| (k.clone(), BTreeSet::new())).collect();
    for (step, step_deps) in deps {
        for dep in step_deps {
            if let Some(children) = dependents.get_mut(dep) {
                children.insert(step.clone());
            }
        }
    }
    dependents
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search over dependency edges. Returns the first cycle found,
/// as a path that starts and ends at the same step.
///
/// The walk keeps its own stack of `(step, remaining dependencies)` frames, so
/// long dependency chains cannot exhaust the thread stack.
fn find_cycle(deps: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> =
        deps.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();
    for (start, start_deps) in deps {
        if marks[start.as_str()] != Mark::Unvisited {
            continue;
        }
        marks.insert(start.as_str(), Mark::InProgress);
        let mut path: Vec<(&str, btree_set::Iter<'_, String>)> =
            vec![(start.as_str(), start_deps.iter())];
        while let Some((node, pending)) = path.last_mut() {
            let node = *node;
            let Some(dep) = pending.next() else {
                marks.insert(node, Mark::Done);
                path.pop();
                continue;
            };
            match marks.get(dep.as_str()).copied().unwrap_or(Mark::Done) {
                Mark::InProgress => {
                    let begin = path
                        .iter()
                        .position(|(s, _)| *s == dep.as_str())
                        .unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[begin..].iter().map(|(s, _)| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(next) = deps.get(dep) {
                        marks.insert(dep.as_str(), Mark::InProgress);
                        path.push((dep.as_str(), next.iter()));
                    }
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Kahn's algorithm with a sorted ready set, so ties break by step id.
fn topological_order(
    deps: &BTreeMap<String, BTreeSet<String>>,
    dependents: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut remaining: BTreeMap<&str, usize> =
        deps.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.to_string());
        if let Some(children) = dependents.get(next) {
            for child in children {
                if let Some(n) = remaining.get_mut(child.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(child.as_str());
                    }
                }
            }
        }
    }
    order
}

fn validate_details(spec: &GraphSpec, index: &BTreeMap<String, usize>) -> Result<(), GraphError> {
    for step in &spec.steps {
        check_id(&step.step_id)?;
        match &step.executor {
            ExecutorSpec::LocalCommand(cmd) => {
                if cmd.argv.is_empty() || cmd.argv[0].trim().is_empty() {
                    return Err(GraphError::EmptyArgv {
                        owner: format!("step '{}'", step.step_id),
                    });
                }
            }
        }
    }

    let mut gate_ids = BTreeSet::new();
    let all_gates = spec
        .steps
        .iter()
        .flat_map(|s| s.gates.iter())
        .chain(spec.run_gates.iter());
    for gate in all_gates {
        check_id(&gate.gate_id)?;
        if !gate_ids.insert(gate.gate_id.clone()) {
            return Err(GraphError::DuplicateGateId(gate.gate_id.clone()));
        }
        if let GateRunnerSpec::LocalCommand(cmd) = &gate.runner
            && (cmd.argv.is_empty() || cmd.argv[0].trim().is_empty())
        {
            return Err(GraphError::EmptyArgv {
                owner: format!("gate '{}'", gate.gate_id),
            });
        }
    }

    for rule in &spec.routing_rules {
        if let RoutingAction::GotoStep { target } = &rule.action
            && !index.contains_key(target)
        {
            return Err(GraphError::UnknownGotoTarget {
                rule_id: rule.rule_id.clone(),
                target: target.clone(),
            });
        }
    }
    Ok(())
}

fn check_id(id: &str) -> Result<(), GraphError> {
    validate_id(id).map_err(|err| GraphError::InvalidId {
        id: id.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{command_gate, graph, step};

    #[test]
    fn acyclic_graph_validates_with_stable_order() {
        let g = graph(vec![
            step("c", &["a", "b"]),
            step("b", &["a"]),
            step("a", &[]),
            step("d", &[]),
        ]);
        let validated = validate_graph(g).expect("valid graph");
        assert_eq!(validated.topo_order(), ["a", "b", "c", "d"]);
    }

    #[test]
    fn ties_break_by_step_id() {
        let g = graph(vec![step("z", &[]), step("m", &[]), step("a", &[])]);
        let validated = validate_graph(g).expect("valid graph");
        assert_eq!(validated.topo_order(), ["a", "m", "z"]);
    }

    #[test]
    fn duplicate_step_ids_are_rejected_first() {
        // Also contains an unknown dependency; uniqueness is checked first.
        let g = graph(vec![step("a", &["missing"]), step("a", &[])]);
        assert_eq!(
            validate_graph(g).unwrap_err(),
            GraphError::DuplicateStepId("a".to_string())
        );
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let g = graph(vec![step("a", &["ghost"])]);
        assert_eq!(
            validate_graph(g).unwrap_err(),
            GraphError::UnknownDependency {
                step_id: "a".to_string(),
                dependency: "ghost".to_string()
            }
        );
    }

    #[test]
    fn cycle_is_reported_as_path() {
        let g = graph(vec![
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ]);
        let err = validate_graph(g).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(vec![
                "a".to_string(),
                "c".to_string(),
                "b".to_string(),
                "a".to_string()
            ])
        );
        assert_eq!(err.to_string(), "dependency cycle: a -> c -> b -> a");
    }

    #[test]
    fn long_dependency_chain_validates() {
        let ids: Vec<String> = (0..100_000).map(|i| format!("s{i:06}")).collect();
        let steps = ids
            .iter()
            .enumerate()
            .map(|(i, id)| match i {
                0 => step(id, &[]),
                _ => step(id, &[ids[i - 1].as_str()]),
            })
            .collect();
        let validated = validate_graph(graph(steps)).expect("valid graph");
        assert_eq!(validated.topo_order().len(), ids.len());
        assert_eq!(validated.topo_order().first(), ids.first());
        assert_eq!(validated.topo_order().last(), ids.last());
    }

    #[test]
    fn long_chain_closing_on_itself_is_a_cycle() {
        let ids: Vec<String> = (0..50_000).map(|i| format!("s{i:06}")).collect();
        let last = ids[ids.len() - 1].as_str();
        let steps = ids
            .iter()
            .enumerate()
            .map(|(i, id)| match i {
                0 => step(id, &[last]),
                _ => step(id, &[ids[i - 1].as_str()]),
            })
            .collect();
        match validate_graph(graph(steps)) {
            Err(GraphError::Cycle(path)) => {
                assert_eq!(path.len(), ids.len() + 1);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = graph(vec![step("a", &["a"])]);
        assert!(matches!(validate_graph(g), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn duplicate_gate_ids_across_steps_and_run_are_rejected() {
        let mut a = step("a", &[]);
        a.gates.push(command_gate("check", &["true"]));
        let mut g = graph(vec![a]);
        g.run_gates.push(command_gate("check", &["true"]));
        assert_eq!(
            validate_graph(g).unwrap_err(),
            GraphError::DuplicateGateId("check".to_string())
        );
    }

    #[test]
    fn step_ids_must_be_path_safe() {
        let g = graph(vec![step("../escape", &[])]);
        assert!(matches!(
            validate_graph(g),
            Err(GraphError::InvalidId { .. })
        ));
    }

    #[test]
    fn downstream_closure_is_transitive_and_ordered() {
        let g = graph(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &["a"]),
            step("e", &[]),
        ]);
        let validated = validate_graph(g).expect("valid graph");
        assert_eq!(validated.downstream_closure("b"), ["b", "c"]);
        assert_eq!(validated.downstream_closure("a"), ["a", "b", "c", "d"]);
        assert_eq!(validated.strict_downstream("a"), ["b", "c", "d"]);
        assert!(validated.strict_downstream("e").is_empty());
    }
}
