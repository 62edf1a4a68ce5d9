//! Per-step failure recovery policy.
//!
//! Server steps carry an optional `error_handling` policy. The decision
//! logic is pure: given the policy and the attempt count, it yields the
//! action the driver takes. Client steps delegate recovery to the caller
//! and never reach this code.

use std::time::Duration;

use windlass_types::{ErrorHandlingSpec, ErrorStrategy, StateUpdateSpec};

/// What the driver does with a failed server step.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Propagate the failure; the workflow fails.
    Propagate,
    /// Log and skip the step.
    Skip,
    /// Re-run the step after the given delay.
    RetryAfter(Duration),
    /// Apply the fallback state update and skip the step.
    Fallback(Option<StateUpdateSpec>),
}

/// Resolves the action for a failure on the given attempt (1-based).
pub fn resolve_failure(policy: &ErrorHandlingSpec, attempt: u32) -> RecoveryAction {
    match policy.strategy {
        ErrorStrategy::Fail => RecoveryAction::Propagate,
        ErrorStrategy::Continue => RecoveryAction::Skip,
        ErrorStrategy::Retry => {
            if attempt <= policy.max_retries {
                RecoveryAction::RetryAfter(Duration::from_millis(policy.delay_ms))
            } else {
                RecoveryAction::Propagate
            }
        }
        ErrorStrategy::Fallback => RecoveryAction::Fallback(policy.fallback.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy_of(value: serde_json::Value) -> ErrorHandlingSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn default_policy_propagates() {
        let policy = ErrorHandlingSpec::default();
        assert_eq!(resolve_failure(&policy, 1), RecoveryAction::Propagate);
    }

    #[test]
    fn continue_always_skips() {
        let policy = policy_of(json!({"strategy": "continue"}));
        assert_eq!(resolve_failure(&policy, 1), RecoveryAction::Skip);
        assert_eq!(resolve_failure(&policy, 99), RecoveryAction::Skip);
    }

    #[test]
    fn retry_is_bounded_by_max_retries() {
        let policy = policy_of(json!({"strategy": "retry", "max_retries": 2, "delay_ms": 10}));
        assert_eq!(resolve_failure(&policy, 1), RecoveryAction::RetryAfter(Duration::from_millis(10)));
        assert_eq!(resolve_failure(&policy, 2), RecoveryAction::RetryAfter(Duration::from_millis(10)));
        assert_eq!(resolve_failure(&policy, 3), RecoveryAction::Propagate);
    }

    #[test]
    fn fallback_carries_the_configured_update() {
        let policy = policy_of(json!({
            "strategy": "fallback",
            "fallback": {"path": "state.result", "value": "default"}
        }));
        match resolve_failure(&policy, 1) {
            RecoveryAction::Fallback(Some(update)) => assert_eq!(update.path, "state.result"),
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
