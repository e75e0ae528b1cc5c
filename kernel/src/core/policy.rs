//! Safety policy checks.
//!
//! Pure functions over a step, its effective policy and the workspace changes
//! observed around its execution. The runner stores whatever these return as
//! policy violation envelopes.

use std::path::{Component, Path, PathBuf};

use crate::core::spec::{ExecutorSpec, SafetyPolicy, StepSpec};
use crate::core::types::{PolicyViolation, ViolationType};

/// How a workspace path changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// One changed file, relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Current size (0 for deletions).
    pub size_bytes: u64,
}

/// Names a step's tool can be allowed under: executor kind, `argv[0]`, and
/// the basename of `argv[0]`.
pub fn tool_names(step: &StepSpec) -> Vec<String> {
    let mut names = vec![step.executor.kind().to_string()];
    match &step.executor {
        ExecutorSpec::LocalCommand(cmd) => {
            if let Some(program) = cmd.argv.first() {
                names.push(program.clone());
                if let Some(base) = Path::new(program).file_name().and_then(|s| s.to_str())
                    && base != program
                {
                    names.push(base.to_string());
                }
            }
        }
    }
    names
}

/// Pre-execution check. A violation here means the command must not run.
pub fn check_tool(step: &StepSpec, policy: &SafetyPolicy, now: &str) -> Option<PolicyViolation> {
    if policy.allowed_tools.is_empty() {
        return None;
    }
    let names = tool_names(step);
    if names.iter().any(|n| policy.allowed_tools.contains(n)) {
        return None;
    }
    Some(PolicyViolation {
        step_id: step.step_id.clone(),
        violation_type: ViolationType::ToolNotAllowed,
        details: format!(
            "tool {} not in allowed_tools [{}]",
            names.join(" / "),
            policy.allowed_tools.join(", ")
        ),
        timestamp: now.to_string(),
    })
}

/// Post-execution checks over observed workspace changes.
///
/// Every offending path produces its own violation; the diff size check
/// produces at most one.
pub fn check_changes(
    step_id: &str,
    changes: &[PathChange],
    policy: &SafetyPolicy,
    now: &str,
) -> Vec<PolicyViolation> {
    let mut violations = Vec::new();
    let violation = |violation_type, details| PolicyViolation {
        step_id: step_id.to_string(),
        violation_type,
        details,
        timestamp: now.to_string(),
    };

    for change in changes {
        let shown = change.path.display();
        if let Some(prefix) = policy
            .deny_write_paths
            .iter()
            .find(|p| is_under(&change.path, p))
        {
            violations.push(violation(
                ViolationType::WriteDenied,
                format!("{:?} {shown} is inside denied path '{prefix}'", change.kind),
            ));
            continue;
        }
        if !policy.allow_write_paths.is_empty()
            && !policy
                .allow_write_paths
                .iter()
                .any(|p| is_under(&change.path, p))
        {
            violations.push(violation(
                ViolationType::WriteOutsideAllowed,
                format!(
                    "{:?} {shown} is outside allow_write_paths [{}]",
                    change.kind,
                    policy.allow_write_paths.join(", ")
                ),
            ));
        }
    }

    if let Some(limit) = policy.max_diff_size_bytes {
        let total = diff_size(changes);
        if total > limit {
            violations.push(violation(
                ViolationType::DiffSizeExceeded,
                format!("changed {total} bytes, limit is {limit}"),
            ));
        }
    }
    violations
}

/// Total bytes of created and modified files.
pub fn diff_size(changes: &[PathChange]) -> u64 {
    changes
        .iter()
        .filter(|c| c.kind != ChangeKind::Deleted)
        .map(|c| c.size_bytes)
        .sum()
}

/// Component-wise prefix match. `"src"` covers `src/a.rs` but not `srcs/a.rs`;
/// an empty or `.` prefix covers everything.
pub fn is_under(path: &Path, prefix: &str) -> bool {
    let path_parts = normal_components(path);
    let prefix_parts = normal_components(Path::new(prefix));
    path_parts.len() >= prefix_parts.len() && path_parts[..prefix_parts.len()] == prefix_parts[..]
}

fn normal_components(path: &Path) -> Vec<&std::ffi::OsStr> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::spec::CommandSpec;
    use crate::test_support::step;

    fn change(path: &str, kind: ChangeKind, size_bytes: u64) -> PathChange {
        PathChange {
            path: PathBuf::from(path),
            kind,
            size_bytes,
        }
    }

    #[test]
    fn prefix_matching_is_per_component() {
        assert!(is_under(Path::new("src/a.rs"), "src"));
        assert!(is_under(Path::new("src/a.rs"), "./src/"));
        assert!(!is_under(Path::new("srcs/a.rs"), "src"));
        assert!(is_under(Path::new("anything"), ""));
        assert!(is_under(Path::new("anything"), "."));
        assert!(!is_under(Path::new("src"), "src/deep"));
    }

    #[test]
    fn empty_allowlist_allows_any_tool() {
        let s = step("a", &[]);
        assert!(check_tool(&s, &SafetyPolicy::default(), "t").is_none());
    }

    #[test]
    fn tool_matches_kind_program_or_basename() {
        let mut s = step("a", &[]);
        s.executor = ExecutorSpec::LocalCommand(CommandSpec {
            argv: vec!["/usr/bin/python3".to_string(), "x.py".to_string()],
            ..CommandSpec::default()
        });

        for allowed in ["local_command", "/usr/bin/python3", "python3"] {
            let policy = SafetyPolicy {
                allowed_tools: vec![allowed.to_string()],
                ..SafetyPolicy::default()
            };
            assert!(check_tool(&s, &policy, "t").is_none(), "{allowed}");
        }

        let policy = SafetyPolicy {
            allowed_tools: vec!["git".to_string()],
            ..SafetyPolicy::default()
        };
        let violation = check_tool(&s, &policy, "t").expect("violation");
        assert_eq!(violation.violation_type, ViolationType::ToolNotAllowed);
        assert_eq!(violation.step_id, "a");
    }

    #[test]
    fn writes_outside_allowlist_are_violations() {
        let policy = SafetyPolicy {
            allow_write_paths: vec!["out".to_string()],
            ..SafetyPolicy::default()
        };
        let changes = vec![
            change("out/report.json", ChangeKind::Created, 10),
            change("src/main.rs", ChangeKind::Modified, 5),
        ];
        let violations = check_changes("a", &changes, &policy, "t");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].violation_type, ViolationType::WriteOutsideAllowed);
        assert!(violations[0].details.contains("src/main.rs"));
    }

    #[test]
    fn deny_paths_win_over_allow_paths() {
        let policy = SafetyPolicy {
            allow_write_paths: vec!["out".to_string()],
            deny_write_paths: vec!["out/secret".to_string()],
            ..SafetyPolicy::default()
        };
        let changes = vec![change("out/secret/key", ChangeKind::Deleted, 0)];
        let violations = check_changes("a", &changes, &policy, "t");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].violation_type, ViolationType::WriteDenied);
    }

    #[test]
    fn diff_size_counts_created_and_modified_only() {
        let policy = SafetyPolicy {
            max_diff_size_bytes: Some(100),
            ..SafetyPolicy::default()
        };
        let within = vec![
            change("a", ChangeKind::Created, 60),
            change("b", ChangeKind::Modified, 40),
            change("c", ChangeKind::Deleted, 0),
        ];
        assert!(check_changes("s", &within, &policy, "t").is_empty());

        let over = vec![
            change("a", ChangeKind::Created, 60),
            change("b", ChangeKind::Modified, 41),
        ];
        let violations = check_changes("s", &over, &policy, "t");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].violation_type, ViolationType::DiffSizeExceeded);
    }

    #[test]
    fn no_changes_no_violations() {
        let policy = SafetyPolicy {
            allow_write_paths: vec!["out".to_string()],
            max_diff_size_bytes: Some(0),
            ..SafetyPolicy::default()
        };
        assert!(check_changes("s", &[], &policy, "t").is_empty());
    }
}
