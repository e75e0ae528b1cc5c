//! Side-effecting helpers: persistence, child processes, artifacts.

pub mod artifact_store;
pub mod atomic;
pub mod clock;
pub mod config;
pub mod environment;
pub mod executor;
pub mod gates;
pub mod inputs;
pub mod layout;
pub mod process;
pub mod run_state;
pub mod schema_registry;
pub mod snapshot;
