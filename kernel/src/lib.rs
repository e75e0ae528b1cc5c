//! Local-first execution kernel.
//!
//! Executes a validated DAG of steps, verifies outputs through gates, routes
//! outcomes through declarative rules, and persists enough state to resume or
//! replay a run after a crash. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (graph validation, selection,
//!   routing, policy evaluation, state transitions). No I/O.
//! - **[`io`]**: Side-effecting operations (artifact store, run state files,
//!   child processes, gates, workspace snapshots).
//!
//! Orchestration modules ([`runner`], [`replay`], [`dry_run`], [`import`],
//! [`validate`]) coordinate core logic with I/O to implement kernel operations.

pub mod core;
pub mod dry_run;
pub mod exit_codes;
pub mod import;
pub mod io;
pub mod logging;
pub mod replay;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
