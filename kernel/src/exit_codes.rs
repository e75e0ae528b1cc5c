//! Stable exit codes for kernel CLI commands.

/// Command succeeded, or the run ended `succeeded`.
pub const OK: i32 = 0;
/// Command failed due to an invalid graph/config/run root or another error.
pub const INVALID: i32 = 1;
/// The run ended `failed`.
pub const RUN_FAILED: i32 = 2;
/// The run ended `blocked` (escalation or unmet dependencies).
pub const RUN_BLOCKED: i32 = 3;
