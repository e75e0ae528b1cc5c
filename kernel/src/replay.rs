//! Replay: re-executing part of a finished or stopped run.
//!
//! Both operations only rewrite `RunState`; nothing in the artifact store is
//! deleted or changed. Callers resume the run afterwards to execute the reset
//! steps.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument};

use crate::core::graph::ValidatedGraph;
use crate::core::state_update::reset_steps;
use crate::core::types::{ArtifactReplacement, RunState, RunStatus};
use crate::io::clock;
use crate::io::executor::Executor;
use crate::io::schema_registry::ARTIFACT_REPLACEMENT_SCHEMA;
use crate::runner::{KERNEL_PRODUCER, Runner};

/// Result of [`Runner::replace_artifact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    /// Id of the stored `kernel.artifact_replacement.v1` envelope.
    pub replacement_id: String,
    pub record: ArtifactReplacement,
    pub state: RunState,
}

impl<E: Executor> Runner<E> {
    /// Reset `step_id` and everything downstream of it to `pending` with fresh
    /// attempt counters. Upstream steps keep their results.
    #[instrument(skip_all, fields(run_root = %run_root.display(), step_id = %step_id))]
    pub fn rerun_from(&self, run_root: &Path, step_id: &str) -> Result<RunState> {
        let mut session = self.open(run_root)?;
        if session.graph.step(step_id).is_none() {
            bail!("unknown step '{step_id}'");
        }
        let closure = session.graph.downstream_closure(step_id);
        reset_steps(&mut session.state, &closure, false, &clock::now());
        session.state.status = RunStatus::Created;
        session.state.status_reason = None;
        session.state.current_step_id = None;
        session.persist()?;
        info!(reset = ?closure, "steps reset for replay");
        Ok(session.state)
    }

    /// Point every consumer of `old_id` at `new_id` and reset the steps whose
    /// results depended on it.
    #[instrument(
        skip_all,
        fields(run_root = %run_root.display(), old_id = %old_id, new_id = %new_id)
    )]
    pub fn replace_artifact(
        &self,
        run_root: &Path,
        old_id: &str,
        new_id: &str,
        reason: &str,
    ) -> Result<Replacement> {
        let mut session = self.open(run_root)?;
        if old_id == new_id {
            bail!("artifact cannot replace itself");
        }
        session
            .store
            .meta(old_id)
            .with_context(|| format!("replaced artifact {old_id}"))?;
        session
            .store
            .meta(new_id)
            .with_context(|| format!("replacement artifact {new_id}"))?;
        if session.state.resolve_artifact_id(new_id) == old_id {
            return Err(anyhow!(
                "replacing {old_id} with {new_id} would create a substitution cycle"
            ));
        }

        let reset = affected_steps(&session.graph, &session.state, old_id);
        let run_gates_consume = session
            .graph
            .spec()
            .run_gates
            .iter()
            .any(|g| consumes(&session.state, &g.artifact_ids, old_id));

        let now = clock::now();
        session
            .state
            .artifact_substitutions
            .insert(old_id.to_string(), new_id.to_string());
        reset_steps(&mut session.state, &reset, false, &now);

        let record = ArtifactReplacement {
            old_artifact_id: old_id.to_string(),
            new_artifact_id: new_id.to_string(),
            reason: reason.to_string(),
            reset_step_ids: reset.clone(),
            timestamp: now.clone(),
        };
        let meta = session.store.put_envelope(
            &session.registry,
            ARTIFACT_REPLACEMENT_SCHEMA,
            KERNEL_PRODUCER,
            &[old_id.to_string(), new_id.to_string()],
            &record,
            &now,
        )?;
        session.state.replacement_ids.push(meta.artifact_id.clone());
        if !reset.is_empty() || run_gates_consume {
            session.state.status = RunStatus::Created;
            session.state.status_reason = None;
            session.state.current_step_id = None;
        }
        session.persist()?;
        info!(
            replacement_id = %meta.artifact_id,
            reset = ?reset,
            run_gates_consume,
            "artifact replaced"
        );
        Ok(Replacement {
            replacement_id: meta.artifact_id,
            record,
            state: session.state,
        })
    }
}

/// Steps whose results depend on `old_id`, in topological order:
/// declared consumers and their downstream, everything downstream of the
/// producer, and steps whose gates read it.
fn affected_steps(graph: &ValidatedGraph, state: &RunState, old_id: &str) -> Vec<String> {
    let mut affected = BTreeSet::new();
    for step in graph.steps_in_order() {
        let id = step.step_id.as_str();
        if consumes(state, &step.input_artifact_ids, old_id)
            || step
                .gates
                .iter()
                .any(|g| consumes(state, &g.artifact_ids, old_id))
        {
            affected.extend(graph.downstream_closure(id));
        }
        if let Some(record) = state.step_records.get(id)
            && record.produced_artifact_ids.iter().any(|p| p == old_id)
        {
            affected.extend(graph.strict_downstream(id));
        }
    }
    let mut ordered: Vec<String> = affected.into_iter().collect();
    ordered.sort_by_key(|id| graph.rank(id));
    ordered
}

fn consumes(state: &RunState, ids: &[String], old_id: &str) -> bool {
    ids.iter().any(|id| state.resolve_artifact_id(id) == old_id)
}
