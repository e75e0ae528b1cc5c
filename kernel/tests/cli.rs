//! CLI tests for the `kernel` binary.
//!
//! Spawns the binary and checks exit codes for valid, invalid, failed and
//! replayed runs.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use kernel::exit_codes;

fn kernel(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kernel"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run kernel")
}

const GRAPH: &str = r#"{
    "graph_id": "cli-demo",
    "steps": [
        {"step_id": "a", "executor": {"kind": "local_command", "argv": ["true"]}},
        {"step_id": "b", "depends_on": ["a"],
         "executor": {"kind": "local_command", "argv": ["sh", "-c", "test -f \"$KERNEL_RUN_ROOT/go\""]}}
    ]
}"#;

#[test]
fn validate_reports_ok_and_cycles() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("graph.json"), GRAPH).expect("write");
    fs::write(
        temp.path().join("cycle.json"),
        r#"{"graph_id": "c", "steps": [
            {"step_id": "a", "depends_on": ["b"], "executor": {"kind": "local_command", "argv": ["true"]}},
            {"step_id": "b", "depends_on": ["a"], "executor": {"kind": "local_command", "argv": ["true"]}}
        ]}"#,
    )
    .expect("write");

    let ok = kernel(temp.path(), &["validate", "graph.json"]);
    assert_eq!(ok.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&ok.stdout).contains("cli-demo"));

    let cycle = kernel(temp.path(), &["validate", "cycle.json"]);
    assert_eq!(cycle.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&cycle.stderr).contains("cycle"));
}

#[test]
fn failed_run_can_be_replayed_to_success() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("graph.json"), GRAPH).expect("write");

    let run = kernel(
        temp.path(),
        &["run", "--graph", "graph.json", "--run-root", "run", "--run-id", "r1"],
    );
    assert_eq!(run.status.code(), Some(exit_codes::RUN_FAILED));

    let status = kernel(temp.path(), &["status", "--run-root", "run", "--json"]);
    assert_eq!(status.status.code(), Some(exit_codes::RUN_FAILED));
    let state: serde_json::Value = serde_json::from_slice(&status.stdout).expect("json");
    assert_eq!(state["step_records"]["a"]["status"], "succeeded");
    assert_eq!(state["step_records"]["b"]["status"], "failed");

    fs::write(temp.path().join("run/go"), "").expect("write");
    let rerun = kernel(temp.path(), &["rerun-from", "--run-root", "run", "--step", "b"]);
    assert_eq!(rerun.status.code(), Some(exit_codes::OK));

    let status = kernel(temp.path(), &["status", "--run-root", "run"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&status.stdout).starts_with("r1 succeeded"));
}

#[test]
fn import_prints_artifact_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("notes.txt"), "hello").expect("write");
    let out = kernel(temp.path(), &["import", "--run-root", "run", "notes.txt"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
    assert!(id.starts_with("art_"), "{id}");
    assert!(temp.path().join("run/artifacts/blobs").join(&id).is_file());
}
