//! The scheduling loop.
//!
//! [`Runner`] owns every `RunState` mutation and the order of IO around it:
//! pick the next eligible step, mark it running and persist, check policy,
//! execute, check policy again, run gates, route, apply, persist. Runs end
//! `succeeded`, `failed` or `blocked`; a crashed run is picked up by
//! [`Runner::resume`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::graph::ValidatedGraph;
use crate::core::ids::{step_producer, validate_id};
use crate::core::policy::{check_changes, check_tool};
use crate::core::routing::{self, RoutingContext};
use crate::core::selector::{Quiescence, classify_quiescent, next_eligible};
use crate::core::spec::{ExecutorSpec, RoutingScope, SafetyPolicy, StepSpec};
use crate::core::state_update::{
    Applied, apply_run_action, apply_step_action, begin_attempt, recover_interrupted,
    retries_exhausted,
};
use crate::core::types::{Outcome, PolicyViolation, RunState, RunStatus};
use crate::io::artifact_store::{ArtifactStore, NewArtifact};
use crate::io::atomic::{to_json_bytes, write_atomic};
use crate::io::clock;
use crate::io::config::{KernelConfig, load_config, write_config};
use crate::io::environment::capture_environment;
use crate::io::executor::{
    ExecOutcome, ExecRequest, Executor, STEP_SUMMARY_FILE, kernel_env, resolve_workdir,
};
use crate::io::gates::{GateEngine, GateRequest, GateRun};
use crate::io::inputs::InputManifest;
use crate::io::layout::{RunPaths, absolute_root, next_attempt_dir};
use crate::io::run_state::{load_run_state, write_run_state};
use crate::io::schema_registry::{
    ENVIRONMENT_SNAPSHOT_SCHEMA, POLICY_VIOLATION_SCHEMA, SchemaRegistry,
};
use crate::io::snapshot::WorkspaceSnapshot;
use crate::validate::load_graph;

/// Producer label for records the kernel writes on its own behalf.
pub const KERNEL_PRODUCER: &str = "kernel";

/// Final (or paused) state of a runner invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub status_reason: Option<String>,
    pub state: RunState,
}

impl RunOutcome {
    fn from_state(state: RunState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            status_reason: state.status_reason.clone(),
            state,
        }
    }
}

/// Executes validated graphs with an [`Executor`].
pub struct Runner<E> {
    executor: E,
    schemas: BTreeMap<String, Value>,
    config: Option<KernelConfig>,
}

impl<E: Executor> Runner<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            schemas: BTreeMap::new(),
            config: None,
        }
    }

    /// Use `config` instead of `<run_root>/kernel.toml`. Written to the run
    /// root at start so resumes see the same settings.
    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register an extra schema for envelopes and `schema_check` gates.
    pub fn register_schema(&mut self, schema_id: &str, schema: Value) -> Result<()> {
        SchemaRegistry::empty().register(schema_id, &schema)?;
        self.schemas.insert(schema_id.to_string(), schema);
        Ok(())
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Create a run under `run_root` and drive it until it stops.
    #[instrument(skip_all, fields(run_id = %run_id, graph_id = %graph.spec().graph_id))]
    pub fn start(
        &self,
        graph: &ValidatedGraph,
        run_id: &str,
        run_root: &Path,
    ) -> Result<RunOutcome> {
        validate_id(run_id).context("invalid run id")?;
        let run_root = &absolute_root(run_root)?;
        let paths = RunPaths::new(run_root);
        if paths.state_path.exists() {
            bail!(
                "run already exists at {}; use resume",
                paths.state_path.display()
            );
        }
        fs::create_dir_all(run_root)
            .with_context(|| format!("create run root {}", run_root.display()))?;
        write_atomic(&paths.graph_path, &to_json_bytes(graph.spec())?)
            .context("write graph.json")?;
        if let Some(config) = &self.config {
            write_config(&paths.config_path, config)?;
        }

        let config = self.load_config(&paths)?;
        let registry = self.registry(&paths, &config)?;
        let store = ArtifactStore::open(&paths.artifacts_dir)?;
        let now = clock::now();

        let lock_file = config
            .dependency_lock_file
            .as_deref()
            .map(|p| KernelConfig::resolve(run_root, p));
        let snapshot = capture_environment(lock_file.as_deref(), &now)?;
        let snapshot_meta = store.put_envelope(
            &registry,
            ENVIRONMENT_SNAPSHOT_SCHEMA,
            KERNEL_PRODUCER,
            &[],
            &snapshot,
            &now,
        )?;

        let mut state = RunState::new(run_id, graph, &now);
        state.environment_snapshot_id = Some(snapshot_meta.artifact_id);
        write_run_state(&paths.state_path, &state)?;
        info!(run_root = %run_root.display(), "run created");

        let mut session =
            Session::new(&self.executor, graph.clone(), paths, store, registry, config, state)?;
        session.activate()?;
        session.run_loop()?;
        Ok(session.into_outcome())
    }

    /// Continue a run after a crash, an escalation or a replay.
    ///
    /// Interrupted steps become `failed`/`interrupted` and are routed before
    /// scheduling resumes. Terminal runs are returned unchanged.
    #[instrument(skip_all, fields(run_root = %run_root.display()))]
    pub fn resume(&self, run_root: &Path) -> Result<RunOutcome> {
        let mut session = self.open(run_root)?;
        if session.state.status.is_terminal() {
            info!(status = session.state.status.as_str(), "run already finished");
            return Ok(session.into_outcome());
        }

        session.activate()?;
        let recovered = recover_interrupted(&mut session.state, &clock::now());
        if !recovered.is_empty() {
            warn!(steps = ?recovered, "reclassified interrupted steps");
            session.persist()?;
            for step_id in &recovered {
                session.route_interrupted(step_id)?;
            }
        }
        session.run_loop()?;
        Ok(session.into_outcome())
    }

    /// Load everything a run needs from its run root.
    pub(crate) fn open(&self, run_root: &Path) -> Result<Session<'_, E>> {
        let run_root = &absolute_root(run_root)?;
        let paths = RunPaths::new(run_root);
        if !paths.state_path.exists() {
            bail!("no run at {}", run_root.display());
        }
        let config = self.load_config(&paths)?;
        let registry = self.registry(&paths, &config)?;
        let graph = load_graph(&paths.graph_path, &registry)?;
        let state = load_run_state(&paths.state_path)?;
        if state.graph_id != graph.spec().graph_id {
            bail!(
                "run state graph '{}' does not match graph.json '{}'",
                state.graph_id,
                graph.spec().graph_id
            );
        }
        let store = ArtifactStore::open(&paths.artifacts_dir)?;
        Session::new(&self.executor, graph, paths, store, registry, config, state)
    }

    pub(crate) fn load_config(&self, paths: &RunPaths) -> Result<KernelConfig> {
        match &self.config {
            Some(config) => {
                config.validate()?;
                Ok(config.clone())
            }
            None => load_config(&paths.config_path),
        }
    }

    pub(crate) fn registry(
        &self,
        paths: &RunPaths,
        config: &KernelConfig,
    ) -> Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::with_builtins()?;
        if let Some(dir) = &config.schema_dir {
            let dir = KernelConfig::resolve(&paths.root, dir);
            let n = registry.load_dir(&dir)?;
            debug!(dir = %dir.display(), schemas = n, "loaded schema dir");
        }
        for (id, schema) in &self.schemas {
            registry.register(id, schema)?;
        }
        Ok(registry)
    }
}

/// One open run: graph, state and the stores around them.
pub(crate) struct Session<'r, E> {
    pub executor: &'r E,
    pub graph: ValidatedGraph,
    pub paths: RunPaths,
    pub store: ArtifactStore,
    pub registry: SchemaRegistry,
    pub config: KernelConfig,
    pub workspace: PathBuf,
    pub state: RunState,
}

/// What one step execution observed, before routing.
struct StepObservation {
    outcome: ExecOutcome,
    violations: Vec<PolicyViolation>,
    gate_runs: Vec<GateRun>,
}

impl<'r, E: Executor> Session<'r, E> {
    fn new(
        executor: &'r E,
        graph: ValidatedGraph,
        paths: RunPaths,
        store: ArtifactStore,
        registry: SchemaRegistry,
        config: KernelConfig,
        state: RunState,
    ) -> Result<Self> {
        let workspace = match &config.workspace_dir {
            Some(dir) => KernelConfig::resolve(&paths.root, dir),
            None => paths.default_workspace(),
        };
        fs::create_dir_all(&workspace)
            .with_context(|| format!("create workspace {}", workspace.display()))?;
        Ok(Self {
            executor,
            graph,
            paths,
            store,
            registry,
            config,
            workspace,
            state,
        })
    }

    pub fn persist(&mut self) -> Result<()> {
        self.state.updated_at = clock::now();
        write_run_state(&self.paths.state_path, &self.state)
    }

    pub fn into_outcome(self) -> RunOutcome {
        RunOutcome::from_state(self.state)
    }

    pub fn gate_engine(&self) -> GateEngine<'_, E> {
        GateEngine {
            executor: self.executor,
            paths: &self.paths,
            store: &self.store,
            registry: &self.registry,
            config: &self.config,
            workspace: &self.workspace,
        }
    }

    /// Policy in force for a step (the graph default unless the step overrides it).
    pub fn policy_for(&self, step_id: &str) -> SafetyPolicy {
        let default = &self.graph.spec().safety_policy;
        self.graph
            .step(step_id)
            .map(|s| s.effective_policy(default).clone())
            .unwrap_or_else(|| default.clone())
    }

    /// Move a `created` or `blocked` run to `running`.
    pub fn activate(&mut self) -> Result<()> {
        if self.state.status.is_terminal() || self.state.status == RunStatus::Running {
            return Ok(());
        }
        self.state.status = RunStatus::Running;
        self.state.status_reason = None;
        self.persist()
    }

    /// Schedule until the run is no longer `running`.
    fn run_loop(&mut self) -> Result<()> {
        while self.state.status == RunStatus::Running {
            let next = next_eligible(&self.graph, &self.state).map(str::to_string);
            if let Some(step_id) = next {
                if self.state.step_executions >= self.config.max_step_executions {
                    self.stop(
                        RunStatus::Blocked,
                        format!(
                            "execution budget of {} step executions exhausted",
                            self.config.max_step_executions
                        ),
                    )?;
                    break;
                }
                self.execute_step(&step_id)?;
                continue;
            }

            match classify_quiescent(&self.graph, &self.state) {
                Quiescence::AllSucceeded => self.run_gates_phase()?,
                Quiescence::PendingUnreachable(ids) => {
                    self.stop(
                        RunStatus::Blocked,
                        format!("steps cannot be scheduled: {}", ids.join(", ")),
                    )?;
                }
                Quiescence::Failed(ids) => {
                    self.stop(
                        RunStatus::Failed,
                        format!("steps did not succeed: {}", ids.join(", ")),
                    )?;
                }
            }
        }
        info!(
            status = self.state.status.as_str(),
            reason = ?self.state.status_reason,
            "run stopped"
        );
        Ok(())
    }

    fn stop(&mut self, status: RunStatus, reason: String) -> Result<()> {
        info!(status = status.as_str(), %reason, "stopping run");
        self.state.status = status;
        self.state.status_reason = Some(reason);
        self.state.current_step_id = None;
        self.persist()
    }

    #[instrument(skip_all, fields(step_id = %step_id))]
    fn execute_step(&mut self, step_id: &str) -> Result<()> {
        let step = self
            .graph
            .step(step_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown step '{step_id}'"))?;
        let policy = self.policy_for(step_id);

        let previous_attempts = self
            .state
            .step_records
            .get(step_id)
            .map_or(0, |r| r.attempts);
        if previous_attempts > 0
            && self.config.honor_backoff
            && let Some(backoff) = step.retry_policy.backoff_seconds
            && backoff > 0
        {
            debug!(backoff, "sleeping before retry");
            std::thread::sleep(Duration::from_secs(backoff));
        }

        let attempt = begin_attempt(&mut self.state, step_id, &clock::now());
        self.persist()?;
        info!(attempt, "executing step");

        let log_dir = next_attempt_dir(&self.paths.step_logs(step_id))?;
        let observation = match check_tool(&step, &policy, &clock::now()) {
            Some(violation) => StepObservation {
                outcome: ExecOutcome::failed(format!("policy violation: {}", violation.details)),
                violations: vec![violation],
                gate_runs: Vec::new(),
            },
            None => self.run_step_command(&step, attempt, &policy, &log_dir)?,
        };

        self.record_observation(step_id, &observation)?;

        let blocking = deciding_gate(&observation.gate_runs);
        let ctx = RoutingContext {
            scope: RoutingScope::Step,
            step_id: Some(step_id.to_string()),
            step_outcome: Some(if observation.outcome.success {
                Outcome::Succeeded
            } else {
                Outcome::Failed
            }),
            gate_id: blocking.map(|g| g.result.gate_id.clone()),
            gate_outcome: blocking.map(|g| g.result.status),
            attempts: attempt,
            retries_exhausted: retries_exhausted(attempt, step.retry_policy.max_retries),
            policy_violation: !observation.violations.is_empty(),
        };
        self.route_step(&ctx)
    }

    /// Inputs, workspace snapshot, command, policy re-check, outputs, gates.
    fn run_step_command(
        &mut self,
        step: &StepSpec,
        attempt: u32,
        policy: &SafetyPolicy,
        log_dir: &Path,
    ) -> Result<StepObservation> {
        let step_id = step.step_id.as_str();
        let requested = self.requested_inputs(step_id);
        let manifest = InputManifest::resolve(&self.store, &self.state, &requested)?;
        let inputs_path = log_dir.join("inputs.json");
        manifest.write(&inputs_path)?;
        {
            let record = self.state.step_records.entry(step_id.to_string()).or_default();
            record.log_paths.push(self.paths.relative(&inputs_path));
            record.input_artifact_hashes = manifest
                .entries
                .iter()
                .map(|e| (e.artifact_id.clone(), e.content_hash.clone()))
                .collect();
        }
        if !manifest.missing.is_empty() {
            return Ok(StepObservation {
                outcome: ExecOutcome::failed(format!(
                    "missing input artifacts: {}",
                    manifest.missing.join("; ")
                )),
                violations: Vec::new(),
                gate_runs: Vec::new(),
            });
        }

        let output_dir = self.paths.step_outputs(step_id, log_dir);
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
        let ExecutorSpec::LocalCommand(cmd) = &step.executor;
        let unit = step_producer(step_id);
        let mut env = kernel_env(
            &self.state.run_id,
            &self.paths.root,
            &unit,
            attempt,
            &inputs_path,
            policy.network_access,
        );
        env.insert(
            "KERNEL_OUTPUT_DIR".to_string(),
            output_dir.display().to_string(),
        );
        let request = ExecRequest {
            unit,
            attempt,
            command: cmd.clone(),
            workdir: resolve_workdir(&self.workspace, cmd.cwd.as_deref()),
            log_dir: log_dir.to_path_buf(),
            summary_file: STEP_SUMMARY_FILE,
            timeout: step
                .timeout_policy
                .timeout_seconds
                .or(self.config.default_step_timeout_secs)
                .map(Duration::from_secs),
            output_limit_bytes: self.config.output_limit_bytes,
            env,
        };

        let managed = self.paths.managed_paths();
        let before = WorkspaceSnapshot::capture_excluding(&self.workspace, &managed)?;
        let outcome = self.executor.execute(&request);
        let after = WorkspaceSnapshot::capture_excluding(&self.workspace, &managed)?;
        let changes = before.diff(&after);
        debug!(changes = changes.len(), success = outcome.success, "step command finished");
        let violations = check_changes(step_id, &changes, policy, &clock::now());

        let mut gate_runs = Vec::new();
        if outcome.success && violations.is_empty() {
            let produced = self.ingest_outputs(step_id, &output_dir)?;
            let engine = self.gate_engine();
            for gate in &step.gates {
                let request = GateRequest::for_step(
                    gate,
                    step_id,
                    attempt,
                    &produced,
                    policy.network_access,
                );
                gate_runs.push(engine.run(&self.state, &request)?);
            }
        }
        Ok(StepObservation {
            outcome,
            violations,
            gate_runs,
        })
    }

    /// Dependencies' produced artifacts (in schedule order) plus declared inputs.
    fn requested_inputs(&self, step_id: &str) -> Vec<String> {
        let Some(step) = self.graph.step(step_id) else {
            return Vec::new();
        };
        let mut requested = step.input_artifact_ids.clone();
        let mut deps: Vec<&String> = step.depends_on.iter().collect();
        deps.sort_by_key(|d| self.graph.rank(d));
        for dep in deps {
            if let Some(record) = self.state.step_records.get(dep.as_str()) {
                requested.extend(record.produced_artifact_ids.iter().cloned());
            }
        }
        requested
    }

    /// Store every file the step wrote to its output directory.
    fn ingest_outputs(&mut self, step_id: &str, output_dir: &Path) -> Result<Vec<String>> {
        let producer = step_producer(step_id);
        let now = clock::now();
        let mut produced = Vec::new();
        let mut hashes = BTreeMap::new();
        for entry in WalkDir::new(output_dir).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", output_dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .strip_prefix(output_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let meta = self.store.put_file(
                entry.path(),
                NewArtifact {
                    producer: &producer,
                    name: Some(&name),
                    schema_id: None,
                    created_at: &now,
                },
            )?;
            debug!(artifact_id = %meta.artifact_id, %name, "ingested output");
            hashes.insert(meta.artifact_id.clone(), meta.content_hash);
            produced.push(meta.artifact_id);
        }
        let record = self.state.step_records.entry(step_id.to_string()).or_default();
        record.produced_artifact_ids = produced.clone();
        record.output_artifact_hashes = hashes;
        Ok(produced)
    }

    /// Store violations and fold the observation into the step record.
    fn record_observation(&mut self, step_id: &str, observation: &StepObservation) -> Result<()> {
        let mut violation_ids = Vec::new();
        for violation in &observation.violations {
            warn!(
                violation_type = ?violation.violation_type,
                details = %violation.details,
                "policy violation"
            );
            let meta = self.store.put_envelope(
                &self.registry,
                POLICY_VIOLATION_SCHEMA,
                &step_producer(step_id),
                &[],
                violation,
                &violation.timestamp,
            )?;
            violation_ids.push(meta.artifact_id);
        }

        let last_error = if let Some(violation) = observation.violations.first() {
            Some(format!("policy violation: {}", violation.details))
        } else if let Some(message) = &observation.outcome.error_message {
            Some(message.clone())
        } else {
            deciding_gate(&observation.gate_runs)
                .filter(|g| g.result.blocks())
                .map(|g| {
                    format!(
                        "gate '{}' failed: {}",
                        g.result.gate_id,
                        g.result.reason.as_deref().unwrap_or("no reason given")
                    )
                })
        };

        let log_paths: Vec<String> = observation
            .outcome
            .log_paths
            .iter()
            .map(|p| self.paths.relative(p))
            .collect();
        let record = self.state.step_records.entry(step_id.to_string()).or_default();
        record.log_paths.extend(log_paths);
        record.duration_ms = Some(observation.outcome.duration_ms);
        record.last_error = last_error;
        record.policy_violation_ids.extend(violation_ids);
        record
            .gate_result_ids
            .extend(observation.gate_runs.iter().map(|g| g.result_id.clone()));
        Ok(())
    }

    fn route_step(&mut self, ctx: &RoutingContext) -> Result<()> {
        let decision = routing::evaluate(ctx, &self.graph.spec().routing_rules);
        info!(
            rule_id = ?decision.rule_id,
            action = ?decision.action,
            failure = ctx.is_failure(),
            "routing decision"
        );
        let applied = apply_step_action(
            &self.graph,
            &mut self.state,
            ctx,
            &decision.action,
            &clock::now(),
        );
        debug!(?applied, "routing applied");
        self.persist()
    }

    /// Route a step that `recover_interrupted` just marked failed.
    fn route_interrupted(&mut self, step_id: &str) -> Result<()> {
        let max_retries = self
            .graph
            .step(step_id)
            .map_or(0, |s| s.retry_policy.max_retries);
        let attempts = self
            .state
            .step_records
            .get(step_id)
            .map_or(0, |r| r.attempts);
        let ctx = RoutingContext {
            scope: RoutingScope::Step,
            step_id: Some(step_id.to_string()),
            step_outcome: Some(Outcome::Failed),
            gate_id: None,
            gate_outcome: None,
            attempts,
            retries_exhausted: retries_exhausted(attempts, max_retries),
            policy_violation: false,
        };
        self.route_step(&ctx)
    }

    /// Run gates once every step has succeeded, then route at run scope.
    fn run_gates_phase(&mut self) -> Result<()> {
        let gates = self.graph.spec().run_gates.clone();
        let round = if gates.is_empty() {
            1
        } else {
            u32::try_from(self.state.run_gate_result_ids.len() / gates.len())
                .unwrap_or(u32::MAX)
                .saturating_add(1)
        };
        let network_access = self.graph.spec().safety_policy.network_access;
        let mut runs = Vec::with_capacity(gates.len());
        {
            let engine = self.gate_engine();
            for gate in &gates {
                let mut request = GateRequest::for_run(gate, network_access);
                request.attempt = round;
                runs.push(engine.run(&self.state, &request)?);
            }
        }
        self.state
            .run_gate_result_ids
            .extend(runs.iter().map(|r| r.result_id.clone()));

        let deciding = deciding_gate(&runs);
        let ctx = RoutingContext {
            scope: RoutingScope::Run,
            step_id: None,
            step_outcome: None,
            gate_id: deciding.map(|g| g.result.gate_id.clone()),
            gate_outcome: deciding.map(|g| g.result.status),
            attempts: round,
            retries_exhausted: true,
            policy_violation: false,
        };
        let decision = routing::evaluate(&ctx, &self.graph.spec().routing_rules);
        info!(
            rule_id = ?decision.rule_id,
            action = ?decision.action,
            failure = ctx.is_failure(),
            "run gate routing decision"
        );
        let applied = apply_run_action(
            &self.graph,
            &mut self.state,
            &ctx,
            &decision.action,
            &clock::now(),
        );
        if let Applied::Goto(target) = &applied {
            info!(%target, "run gates sent scheduling back");
        }
        self.persist()
    }
}

/// The gate routing looks at: the first blocking failure, else the last
/// required gate. Optional gates never decide.
fn deciding_gate(runs: &[GateRun]) -> Option<&GateRun> {
    runs.iter()
        .find(|r| r.result.blocks())
        .or_else(|| runs.iter().rev().find(|r| r.result.required))
}

