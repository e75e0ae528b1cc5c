//! Deterministic, pure logic shared by the kernel.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod graph;
pub mod ids;
pub mod policy;
pub mod routing;
pub mod selector;
pub mod spec;
pub mod state_update;
pub mod types;
