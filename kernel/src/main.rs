//! Operator CLI for the execution kernel.
//!
//! Every subcommand works on one run root. Exit codes are stable, see
//! [`kernel::exit_codes`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};

use kernel::core::types::{RunState, RunStatus};
use kernel::exit_codes;
use kernel::io::config::load_config;
use kernel::io::executor::LocalExecutor;
use kernel::io::layout::RunPaths;
use kernel::io::run_state::load_run_state;
use kernel::io::schema_registry::SchemaRegistry;
use kernel::logging;
use kernel::runner::{RunOutcome, Runner};
use kernel::validate::load_graph;

#[derive(Parser)]
#[command(
    name = "kernel",
    version,
    about = "Local-first execution kernel for step graphs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a graph file against the schema and the structural rules.
    Validate {
        graph: PathBuf,
    },
    /// Start a new run.
    Run {
        #[arg(long)]
        graph: PathBuf,
        #[arg(long)]
        run_root: PathBuf,
        /// Defaults to `run-<UTC timestamp>`.
        #[arg(long)]
        run_id: Option<String>,
        /// Kernel config to copy into the run root.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Continue an interrupted, blocked or replayed run.
    Resume {
        #[arg(long)]
        run_root: PathBuf,
    },
    /// Print the run state.
    Status {
        #[arg(long)]
        run_root: PathBuf,
        /// Print `run_state.json` as is.
        #[arg(long)]
        json: bool,
    },
    /// Reset a step and its downstream closure, then resume.
    RerunFrom {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        step: String,
        /// Only reset; do not resume.
        #[arg(long)]
        no_run: bool,
    },
    /// Substitute one artifact for another, then resume.
    ReplaceArtifact {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
        #[arg(long)]
        reason: String,
        /// Only record the replacement; do not resume.
        #[arg(long)]
        no_run: bool,
    },
    /// Re-run gates against existing artifacts without changing the run.
    DryRunGates {
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Store a file in the run's artifact store and print its id.
    Import {
        #[arg(long)]
        run_root: PathBuf,
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
        /// Require the file to be JSON valid against this schema.
        #[arg(long)]
        schema_id: Option<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let runner = Runner::new(LocalExecutor);
    match cli.command {
        Command::Validate { graph } => cmd_validate(&graph),
        Command::Run {
            graph,
            run_root,
            run_id,
            config,
        } => cmd_run(&graph, &run_root, run_id, config.as_deref()),
        Command::Resume { run_root } => report(&runner.resume(&run_root)?),
        Command::Status { run_root, json } => cmd_status(&run_root, json),
        Command::RerunFrom {
            run_root,
            step,
            no_run,
        } => {
            let state = runner.rerun_from(&run_root, &step)?;
            if no_run {
                print_state(&state);
                return Ok(exit_codes::OK);
            }
            report(&runner.resume(&run_root)?)
        }
        Command::ReplaceArtifact {
            run_root,
            old,
            new,
            reason,
            no_run,
        } => {
            let replacement = runner.replace_artifact(&run_root, &old, &new, &reason)?;
            println!("{}", replacement.replacement_id);
            if no_run {
                return Ok(exit_codes::OK);
            }
            report(&runner.resume(&run_root)?)
        }
        Command::DryRunGates { run_root, json } => {
            let report = runner.dry_run_gates(&run_root)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize report")?
                );
            } else {
                for gate in &report.gates {
                    println!(
                        "{:<8} {}{} {}",
                        gate.status.as_str(),
                        gate.step_id
                            .as_deref()
                            .map(|s| format!("{s}/"))
                            .unwrap_or_default(),
                        gate.gate_id,
                        gate.reason.as_deref().unwrap_or("")
                    );
                }
                for step in &report.skipped_steps {
                    println!("skipped  {step}");
                }
            }
            Ok(if report.passed() {
                exit_codes::OK
            } else {
                exit_codes::RUN_FAILED
            })
        }
        Command::Import {
            run_root,
            file,
            name,
            schema_id,
        } => {
            let meta =
                runner.import_file(&run_root, &file, name.as_deref(), schema_id.as_deref())?;
            println!("{}", meta.artifact_id);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_validate(graph: &Path) -> Result<i32> {
    let registry = SchemaRegistry::with_builtins()?;
    let graph = load_graph(graph, &registry)?;
    println!(
        "ok {} ({} steps)",
        graph.spec().graph_id,
        graph.topo_order().len()
    );
    Ok(exit_codes::OK)
}

fn cmd_run(
    graph: &Path,
    run_root: &Path,
    run_id: Option<String>,
    config: Option<&Path>,
) -> Result<i32> {
    let registry = SchemaRegistry::with_builtins()?;
    let graph = load_graph(graph, &registry)?;
    let mut runner = Runner::new(LocalExecutor);
    if let Some(path) = config {
        if !path.exists() {
            bail!("config {} not found", path.display());
        }
        runner = runner.with_config(load_config(path)?);
    }
    let run_id =
        run_id.unwrap_or_else(|| Utc::now().format("run-%Y%m%d-%H%M%S").to_string());
    report(&runner.start(&graph, &run_id, run_root)?)
}

fn cmd_status(run_root: &Path, json: bool) -> Result<i32> {
    let paths = RunPaths::new(run_root);
    let state = load_run_state(&paths.state_path)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&state).context("serialize run state")?
        );
    } else {
        print_state(&state);
    }
    Ok(status_code(state.status))
}

fn report(outcome: &RunOutcome) -> Result<i32> {
    print_state(&outcome.state);
    Ok(status_code(outcome.status))
}

fn print_state(state: &RunState) {
    match &state.status_reason {
        Some(reason) => println!("{} {}: {reason}", state.run_id, state.status.as_str()),
        None => println!("{} {}", state.run_id, state.status.as_str()),
    }
    for (id, record) in &state.step_records {
        let status = record.status.as_str();
        match &record.last_error {
            Some(err) => println!("  {id:<24} {status:<10} attempts={} {err}", record.attempts),
            None => println!("  {id:<24} {status:<10} attempts={}", record.attempts),
        }
    }
}

fn status_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Failed => exit_codes::RUN_FAILED,
        RunStatus::Blocked => exit_codes::RUN_BLOCKED,
        RunStatus::Created | RunStatus::Running | RunStatus::Succeeded => exit_codes::OK,
    }
}
