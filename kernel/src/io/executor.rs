//! Executor abstraction for running one step or gate command.
//!
//! The [`Executor`] trait decouples the runner from how a command is hosted.
//! [`LocalExecutor`] spawns a child process; tests use scripted executors that
//! return predetermined outcomes without spawning anything, and sandboxed
//! hosts can slot in behind the same trait.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::spec::{CommandSpec, NetworkAccess};
use crate::io::atomic::to_json_bytes;
use crate::io::process::{CommandOutput, millis, run_command};

pub const STEP_SUMMARY_FILE: &str = "executor-summary";
pub const GATE_SUMMARY_FILE: &str = "runner-summary";

/// Parameters for one execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// `step:<id>` or `gate:<id>`.
    pub unit: String,
    pub attempt: u32,
    pub command: CommandSpec,
    /// Resolved working directory.
    pub workdir: PathBuf,
    /// Fresh per-attempt directory for stdout, stderr and the summary.
    pub log_dir: PathBuf,
    /// File name of the JSON summary inside `log_dir`.
    pub summary_file: &'static str,
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
    /// Kernel-provided environment, applied over `command.env`.
    pub env: BTreeMap<String, String>,
}

/// Structured result of an execution. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub error_message: Option<String>,
    pub log_paths: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl ExecOutcome {
    /// Failure that happened before or instead of running anything.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            timed_out: false,
            error_message: Some(message.into()),
            log_paths: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Environment every child sees, before unit-specific additions
/// (`KERNEL_OUTPUT_DIR` for steps, `KERNEL_METRICS_FILE` for gates).
pub fn kernel_env(
    run_id: &str,
    run_root: &Path,
    unit: &str,
    attempt: u32,
    inputs_file: &Path,
    network_access: NetworkAccess,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("KERNEL_RUN_ID".to_string(), run_id.to_string()),
        ("KERNEL_RUN_ROOT".to_string(), run_root.display().to_string()),
        ("KERNEL_UNIT".to_string(), unit.to_string()),
        ("KERNEL_ATTEMPT".to_string(), attempt.to_string()),
        (
            "KERNEL_INPUTS_FILE".to_string(),
            inputs_file.display().to_string(),
        ),
        (
            "KERNEL_NETWORK_ACCESS".to_string(),
            network_access.as_str().to_string(),
        ),
    ])
}

/// Resolve a command's `cwd` against the workspace.
pub fn resolve_workdir(workspace: &Path, cwd: Option<&Path>) -> PathBuf {
    match cwd {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => workspace.join(dir),
        None => workspace.to_path_buf(),
    }
}

/// Abstraction over process hosts.
pub trait Executor {
    /// Run the request's command. Spawn failures, non-zero exits and timeouts
    /// are reported through [`ExecOutcome`].
    fn execute(&self, request: &ExecRequest) -> ExecOutcome;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, request: &ExecRequest) -> ExecOutcome {
        (**self).execute(request)
    }
}

/// Executor that spawns a local child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

#[derive(Debug, Serialize)]
struct ExecSummary<'a> {
    unit: &'a str,
    attempt: u32,
    argv: &'a [String],
    cwd: String,
    env: BTreeMap<&'a str, &'a str>,
    timeout_seconds: Option<f64>,
    exit_code: Option<i32>,
    timed_out: bool,
    success: bool,
    error_message: Option<&'a str>,
    duration_ms: u64,
    stdout_truncated_bytes: usize,
    stderr_truncated_bytes: usize,
}

impl Executor for LocalExecutor {
    #[instrument(skip_all, fields(unit = %request.unit, attempt = request.attempt))]
    fn execute(&self, request: &ExecRequest) -> ExecOutcome {
        let Some((program, args)) = request.command.argv.split_first() else {
            return ExecOutcome::failed("command argv is empty");
        };
        info!(workdir = %request.workdir.display(), "starting command");
        let started = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .envs(&request.command.env)
            .envs(&request.env);

        let run = run_command(cmd, request.timeout, request.output_limit_bytes);
        let duration_ms = millis(started.elapsed());

        let (exit_code, timed_out, mut error_message) = match &run {
            Ok(output) if output.timed_out => (
                output.status.code(),
                true,
                Some(format!("timed out after {:?}", request.timeout.unwrap_or_default())),
            ),
            Ok(output) if output.status.success() => (output.status.code(), false, None),
            Ok(output) => (
                output.status.code(),
                false,
                Some(match output.status.code() {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_string(),
                }),
            ),
            Err(err) => (None, false, Some(format!("{err:#}"))),
        };
        let mut success = error_message.is_none();

        let written = write_logs(
            request,
            run.as_ref().ok(),
            &ExecSummary {
                unit: &request.unit,
                attempt: request.attempt,
                argv: &request.command.argv,
                cwd: request.workdir.display().to_string(),
                env: request
                    .command
                    .env
                    .iter()
                    .chain(&request.env)
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect(),
                timeout_seconds: request.timeout.map(|t| t.as_secs_f64()),
                exit_code,
                timed_out,
                success,
                error_message: error_message.as_deref(),
                duration_ms,
                stdout_truncated_bytes: run.as_ref().map_or(0, |o| o.stdout.dropped),
                stderr_truncated_bytes: run.as_ref().map_or(0, |o| o.stderr.dropped),
            },
        );
        let log_paths = match written {
            Ok(paths) => paths,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to write execution logs");
                success = false;
                error_message = Some(format!("write logs: {err:#}"));
                Vec::new()
            }
        };

        if success {
            debug!(duration_ms, "command succeeded");
        } else {
            warn!(exit_code = ?exit_code, timed_out, error = ?error_message, "command failed");
        }
        ExecOutcome {
            success,
            exit_code,
            timed_out,
            error_message,
            log_paths,
            duration_ms,
        }
    }
}

fn write_logs(
    request: &ExecRequest,
    output: Option<&CommandOutput>,
    summary: &ExecSummary<'_>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(&request.log_dir)
        .with_context(|| format!("create log dir {}", request.log_dir.display()))?;
    let stdout_path = request.log_dir.join("stdout");
    let stderr_path = request.log_dir.join("stderr");
    let summary_path = request.log_dir.join(request.summary_file);

    let (stdout, stderr) = match output {
        Some(o) => (
            o.stdout.with_marker("stdout"),
            o.stderr.with_marker("stderr"),
        ),
        None => (Vec::new(), Vec::new()),
    };
    write_file(&stdout_path, &stdout)?;
    write_file(&stderr_path, &stderr)?;
    write_file(&summary_path, &to_json_bytes(summary)?)?;
    Ok(vec![stdout_path, stderr_path, summary_path])
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(dir: &Path, argv: &[&str], timeout: Option<Duration>) -> ExecRequest {
        ExecRequest {
            unit: "step:a".to_string(),
            attempt: 1,
            command: CommandSpec {
                argv: argv.iter().map(|s| s.to_string()).collect(),
                cwd: None,
                env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
            },
            workdir: dir.to_path_buf(),
            log_dir: dir.join("logs"),
            summary_file: STEP_SUMMARY_FILE,
            timeout,
            output_limit_bytes: 10_000,
            env: BTreeMap::from([("KERNEL_ATTEMPT".to_string(), "1".to_string())]),
        }
    }

    #[test]
    fn success_writes_logs_and_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(
            temp.path(),
            &["sh", "-c", "echo $GREETING-$KERNEL_ATTEMPT"],
            None,
        );
        let outcome = LocalExecutor.execute(&req);
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.log_paths.len(), 3);
        let stdout = fs::read_to_string(req.log_dir.join("stdout")).expect("stdout");
        assert_eq!(stdout, "hi-1\n");

        let summary: serde_json::Value = serde_json::from_slice(
            &fs::read(req.log_dir.join(STEP_SUMMARY_FILE)).expect("summary"),
        )
        .expect("json");
        assert_eq!(summary["exit_code"], 0);
        assert_eq!(summary["env"]["KERNEL_ATTEMPT"], "1");
    }

    #[test]
    fn non_zero_exit_is_structured_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = LocalExecutor.execute(&request(temp.path(), &["sh", "-c", "exit 4"], None));
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(4));
        assert_eq!(outcome.error_message.as_deref(), Some("exited with status 4"));
    }

    #[test]
    fn spawn_failure_is_structured_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = LocalExecutor.execute(&request(
            temp.path(),
            &["definitely-not-a-real-binary-xyz"],
            None,
        ));
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.error_message.is_some());
        assert!(temp.path().join("logs").join(STEP_SUMMARY_FILE).is_file());
    }

    #[test]
    fn timeout_is_structured_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = LocalExecutor.execute(&request(
            temp.path(),
            &["sleep", "5"],
            Some(Duration::from_millis(200)),
        ));
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.duration_ms < 5_000);
    }

    #[test]
    fn timeout_covers_commands_started_by_a_shell() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = LocalExecutor.execute(&request(
            temp.path(),
            &["sh", "-c", "sleep 8; echo done"],
            Some(Duration::from_millis(500)),
        ));
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.duration_ms < 3_000, "took {}ms", outcome.duration_ms);
        let stdout = fs::read_to_string(temp.path().join("logs/stdout")).expect("stdout");
        assert!(!stdout.contains("done"));
    }
}
