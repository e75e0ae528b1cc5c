//! Routing: a pure mapping from the latest outcome to the next action.
//!
//! Rules are data. A single first-match function evaluates them in
//! declaration order; when nothing matches the default table applies:
//!
//! | situation                          | action      |
//! |------------------------------------|-------------|
//! | policy violation                   | `abort_run` |
//! | failure, retries remaining         | `retry_step`|
//! | failure, retries exhausted         | `abort_run` |
//! | success                            | `continue`  |

use serde::Serialize;

use crate::core::spec::{RoutingAction, RoutingCondition, RoutingRule, RoutingScope};
use crate::core::types::{GateStatus, Outcome};

/// Summary of the outcome routing decides on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingContext {
    pub scope: RoutingScope,
    pub step_id: Option<String>,
    /// Outcome of the executor itself (`None` for run scope).
    pub step_outcome: Option<Outcome>,
    /// The deciding gate: the first blocking failure, else the last required gate.
    pub gate_id: Option<String>,
    pub gate_outcome: Option<GateStatus>,
    pub attempts: u32,
    pub retries_exhausted: bool,
    pub policy_violation: bool,
}

impl RoutingContext {
    /// True if anything about this outcome should stop progression.
    pub fn is_failure(&self) -> bool {
        self.policy_violation
            || self.step_outcome == Some(Outcome::Failed)
            || self.gate_outcome == Some(GateStatus::Failed)
    }
}

/// The chosen action and the rule that produced it (`None` for the default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub action: RoutingAction,
    pub rule_id: Option<String>,
}

/// Evaluate rules in order; the first matching rule wins.
pub fn evaluate(ctx: &RoutingContext, rules: &[RoutingRule]) -> RoutingDecision {
    for rule in rules {
        if matches(&rule.when, ctx) {
            return RoutingDecision {
                action: rule.action.clone(),
                rule_id: Some(rule.rule_id.clone()),
            };
        }
    }
    RoutingDecision {
        action: default_action(ctx),
        rule_id: None,
    }
}

/// Conjunctive match; unset condition fields are ignored.
pub fn matches(cond: &RoutingCondition, ctx: &RoutingContext) -> bool {
    field_matches(cond.scope.as_ref(), Some(&ctx.scope))
        && field_matches(cond.step_id.as_ref(), ctx.step_id.as_ref())
        && field_matches(cond.step_outcome.as_ref(), ctx.step_outcome.as_ref())
        && field_matches(cond.gate_id.as_ref(), ctx.gate_id.as_ref())
        && field_matches(cond.gate_outcome.as_ref(), ctx.gate_outcome.as_ref())
        && field_matches(cond.retries_exhausted.as_ref(), Some(&ctx.retries_exhausted))
        && field_matches(cond.policy_violation.as_ref(), Some(&ctx.policy_violation))
}

fn field_matches<T: PartialEq>(expected: Option<&T>, actual: Option<&T>) -> bool {
    match expected {
        None => true,
        Some(want) => actual == Some(want),
    }
}

/// Behaviour when no rule matches.
pub fn default_action(ctx: &RoutingContext) -> RoutingAction {
    if ctx.policy_violation {
        return RoutingAction::AbortRun {
            reason: Some(describe_failure(ctx)),
        };
    }
    if !ctx.is_failure() {
        return RoutingAction::Continue;
    }
    if ctx.retries_exhausted {
        RoutingAction::AbortRun {
            reason: Some(describe_failure(ctx)),
        }
    } else {
        RoutingAction::RetryStep
    }
}

/// Human-readable reason used when the runner aborts or escalates.
pub fn describe_failure(ctx: &RoutingContext) -> String {
    let subject = match (&ctx.scope, &ctx.step_id) {
        (RoutingScope::Step, Some(id)) => format!("step '{id}'"),
        _ => "run gates".to_string(),
    };
    if ctx.policy_violation {
        return format!("{subject}: policy violation");
    }
    if ctx.gate_outcome == Some(GateStatus::Failed)
        && let Some(gate) = &ctx.gate_id
    {
        return format!("{subject}: gate '{gate}' failed (attempt {})", ctx.attempts);
    }
    if ctx.retries_exhausted {
        return format!("{subject}: failed after {} attempt(s)", ctx.attempts);
    }
    format!("{subject}: failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_ctx(outcome: Outcome) -> RoutingContext {
        RoutingContext {
            scope: RoutingScope::Step,
            step_id: Some("b".to_string()),
            step_outcome: Some(outcome),
            gate_id: None,
            gate_outcome: None,
            attempts: 1,
            retries_exhausted: false,
            policy_violation: false,
        }
    }

    fn rule(id: &str, when: RoutingCondition, action: RoutingAction) -> RoutingRule {
        RoutingRule {
            rule_id: id.to_string(),
            when,
            action,
        }
    }

    #[test]
    fn default_continue_on_success() {
        let decision = evaluate(&step_ctx(Outcome::Succeeded), &[]);
        assert_eq!(decision.action, RoutingAction::Continue);
        assert_eq!(decision.rule_id, None);
    }

    #[test]
    fn default_retry_then_abort_on_failure() {
        let mut ctx = step_ctx(Outcome::Failed);
        assert_eq!(evaluate(&ctx, &[]).action, RoutingAction::RetryStep);

        ctx.retries_exhausted = true;
        ctx.attempts = 2;
        assert_eq!(
            evaluate(&ctx, &[]).action,
            RoutingAction::AbortRun {
                reason: Some("step 'b': failed after 2 attempt(s)".to_string())
            }
        );
    }

    #[test]
    fn policy_violation_aborts_even_with_retries_left() {
        let mut ctx = step_ctx(Outcome::Succeeded);
        ctx.policy_violation = true;
        assert!(matches!(
            evaluate(&ctx, &[]).action,
            RoutingAction::AbortRun { .. }
        ));
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut ctx = step_ctx(Outcome::Succeeded);
        ctx.gate_id = Some("review".to_string());
        ctx.gate_outcome = Some(GateStatus::Failed);

        let rules = vec![
            rule(
                "only-a",
                RoutingCondition {
                    step_id: Some("a".to_string()),
                    ..RoutingCondition::default()
                },
                RoutingAction::Continue,
            ),
            rule(
                "gate-fail",
                RoutingCondition {
                    gate_outcome: Some(GateStatus::Failed),
                    ..RoutingCondition::default()
                },
                RoutingAction::Escalate { reason: None },
            ),
            rule(
                "catch-all",
                RoutingCondition::default(),
                RoutingAction::AbortRun { reason: None },
            ),
        ];

        let decision = evaluate(&ctx, &rules);
        assert_eq!(decision.rule_id.as_deref(), Some("gate-fail"));
        assert_eq!(decision.action, RoutingAction::Escalate { reason: None });
    }

    #[test]
    fn conditions_are_conjunctive() {
        let ctx = step_ctx(Outcome::Failed);
        let cond = RoutingCondition {
            step_id: Some("b".to_string()),
            retries_exhausted: Some(true),
            ..RoutingCondition::default()
        };
        assert!(!matches(&cond, &ctx));

        let cond = RoutingCondition {
            step_id: Some("b".to_string()),
            step_outcome: Some(Outcome::Failed),
            ..RoutingCondition::default()
        };
        assert!(matches(&cond, &ctx));
    }

    #[test]
    fn gate_condition_does_not_match_context_without_gate() {
        let ctx = step_ctx(Outcome::Failed);
        let cond = RoutingCondition {
            gate_outcome: Some(GateStatus::Failed),
            ..RoutingCondition::default()
        };
        assert!(!matches(&cond, &ctx));
    }

    #[test]
    fn run_scope_failure_describes_gate() {
        let ctx = RoutingContext {
            scope: RoutingScope::Run,
            step_id: None,
            step_outcome: None,
            gate_id: Some("final".to_string()),
            gate_outcome: Some(GateStatus::Failed),
            attempts: 1,
            retries_exhausted: true,
            policy_violation: false,
        };
        assert_eq!(
            default_action(&ctx),
            RoutingAction::AbortRun {
                reason: Some("run gates: gate 'final' failed (attempt 1)".to_string())
            }
        );
    }
}
