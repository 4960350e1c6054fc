//! Condition evaluators — decide whether a group's error or success
//! condition currently holds.
//!
//! Thresholds are integer percentages in `[0, 100]`. The two threshold
//! conditions are deliberately asymmetric:
//!
//! - error: `errored / live_action_count > threshold` (strict), false when
//!   the group has no actions;
//! - success: `finished / target_count >= threshold` (inclusive), true when
//!   the group has no targets. The denominator is the count fixed at group
//!   creation, so removing targets never shrinks it.

use std::sync::Arc;

use canopy_state::{ActionStatus, Rollout, RolloutGroup};
use tracing::debug;

use crate::backend::ActionLedger;
use crate::error::{EngineError, EngineResult};

/// Decides whether a condition holds for a group.
pub trait ConditionEvaluator: Send + Sync {
    /// Check an expression without evaluating it.
    fn verify_expression(&self, expression: &str) -> EngineResult<()>;

    fn evaluate(
        &self,
        rollout: &Rollout,
        group: &RolloutGroup,
        expression: &str,
    ) -> EngineResult<bool>;
}

/// Parse a threshold percentage.
pub fn parse_threshold(kind: &'static str, expression: &str) -> EngineResult<u64> {
    let invalid = |reason: &str| EngineError::InvalidExpression {
        kind,
        expression: expression.to_string(),
        reason: reason.to_string(),
    };
    let value: u64 = expression
        .trim()
        .parse()
        .map_err(|_| invalid("not an integer"))?;
    if value > 100 {
        return Err(invalid("must be between 0 and 100"));
    }
    Ok(value)
}

/// `errored / total > threshold%`, false for an empty group.
pub fn error_threshold_exceeded(errored: u64, total: u64, threshold: u64) -> bool {
    if total == 0 {
        return false;
    }
    // Widened so huge fleets cannot overflow.
    u128::from(errored) * 100 > u128::from(threshold) * u128::from(total)
}

/// `finished / total >= threshold%`, true for an empty group.
pub fn success_threshold_reached(finished: u64, total: u64, threshold: u64) -> bool {
    if total == 0 {
        return true;
    }
    u128::from(finished) * 100 >= u128::from(threshold) * u128::from(total)
}

/// Error condition `threshold`.
pub struct ThresholdErrorCondition {
    ledger: Arc<dyn ActionLedger>,
}

impl ThresholdErrorCondition {
    pub fn new(ledger: Arc<dyn ActionLedger>) -> Self {
        Self { ledger }
    }
}

impl ConditionEvaluator for ThresholdErrorCondition {
    fn verify_expression(&self, expression: &str) -> EngineResult<()> {
        parse_threshold("error condition", expression).map(|_| ())
    }

    fn evaluate(
        &self,
        rollout: &Rollout,
        group: &RolloutGroup,
        expression: &str,
    ) -> EngineResult<bool> {
        let threshold = parse_threshold("error condition", expression)?;
        let total = self.ledger.count_all(rollout.id, group.id)?;
        if total == 0 {
            return Ok(false);
        }
        let errored = self
            .ledger
            .count_by_status(rollout.id, group.id, ActionStatus::Error)?;
        let met = error_threshold_exceeded(errored, total, threshold);
        debug!(
            rollout = rollout.id,
            group = group.id,
            errored,
            total,
            threshold,
            met,
            "error condition evaluated"
        );
        Ok(met)
    }
}

/// Success condition `threshold`.
pub struct ThresholdSuccessCondition {
    ledger: Arc<dyn ActionLedger>,
}

impl ThresholdSuccessCondition {
    pub fn new(ledger: Arc<dyn ActionLedger>) -> Self {
        Self { ledger }
    }
}

impl ConditionEvaluator for ThresholdSuccessCondition {
    fn verify_expression(&self, expression: &str) -> EngineResult<()> {
        parse_threshold("success condition", expression).map(|_| ())
    }

    fn evaluate(
        &self,
        rollout: &Rollout,
        group: &RolloutGroup,
        expression: &str,
    ) -> EngineResult<bool> {
        let threshold = parse_threshold("success condition", expression)?;
        let total = group.target_count;
        if total == 0 {
            return Ok(true);
        }
        let finished = self
            .ledger
            .count_by_status(rollout.id, group.id, ActionStatus::Finished)?;
        let met = success_threshold_reached(finished, total, threshold);
        debug!(
            rollout = rollout.id,
            group = group.id,
            finished,
            total,
            threshold,
            met,
            "success condition evaluated"
        );
        Ok(met)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_state::{GroupConditions, GroupId, GroupStatus, RolloutId, RolloutStatus};
    use proptest::prelude::*;

    /// Fixed counts per status.
    struct FixedLedger {
        total: u64,
        finished: u64,
        errored: u64,
    }

    impl ActionLedger for FixedLedger {
        fn count_by_status(
            &self,
            _rollout: RolloutId,
            _group: GroupId,
            status: ActionStatus,
        ) -> EngineResult<u64> {
            Ok(match status {
                ActionStatus::Finished => self.finished,
                ActionStatus::Error => self.errored,
                _ => 0,
            })
        }

        fn count_all(&self, _rollout: RolloutId, _group: GroupId) -> EngineResult<u64> {
            Ok(self.total)
        }
    }

    fn rollout() -> Rollout {
        Rollout {
            id: 1,
            name: "r".into(),
            description: None,
            bundle_id: "b".into(),
            target_query: "q".into(),
            status: RolloutStatus::Running,
            conditions: GroupConditions::default(),
            total_targets: 0,
            start_at: None,
            deleted: false,
            approval_decided_by: None,
            approval_remark: None,
            version: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn group(target_count: u64) -> RolloutGroup {
        RolloutGroup {
            id: 2,
            rollout_id: 1,
            parent: None,
            ordinal: 0,
            name: "g".into(),
            target_percentage: 100.0,
            target_count,
            status: GroupStatus::Running,
            conditions: GroupConditions::default(),
            version: 1,
            updated_at: 0,
        }
    }

    fn ledger(total: u64, finished: u64, errored: u64) -> Arc<dyn ActionLedger> {
        Arc::new(FixedLedger {
            total,
            finished,
            errored,
        })
    }

    #[test]
    fn threshold_parsing() {
        assert_eq!(parse_threshold("success condition", "80").unwrap(), 80);
        assert_eq!(parse_threshold("success condition", " 0 ").unwrap(), 0);
        assert_eq!(parse_threshold("success condition", "100").unwrap(), 100);
        for bad in ["101", "-1", "", "80%", "abc", "50.5"] {
            let err = parse_threshold("success condition", bad).unwrap_err();
            assert!(err.is_configuration(), "{bad} should be rejected");
        }
    }

    #[test]
    fn verify_rejects_without_touching_ledger() {
        let cond = ThresholdErrorCondition::new(ledger(0, 0, 0));
        assert!(cond.verify_expression("20").is_ok());
        assert!(cond.verify_expression("x").unwrap_err().is_configuration());
    }

    #[test]
    fn success_is_inclusive() {
        let cond = ThresholdSuccessCondition::new(ledger(100, 50, 0));
        assert!(cond.evaluate(&rollout(), &group(100), "50").unwrap());
        assert!(!cond.evaluate(&rollout(), &group(100), "51").unwrap());
    }

    #[test]
    fn error_is_strict() {
        let cond = ThresholdErrorCondition::new(ledger(100, 0, 5));
        assert!(!cond.evaluate(&rollout(), &group(100), "5").unwrap());
        assert!(cond.evaluate(&rollout(), &group(100), "4").unwrap());
    }

    #[test]
    fn success_uses_fixed_target_count() {
        // Two targets were removed: 8 of 10 finished, live count is 8.
        let cond = ThresholdSuccessCondition::new(ledger(8, 8, 0));
        assert!(!cond.evaluate(&rollout(), &group(10), "90").unwrap());
        assert!(cond.evaluate(&rollout(), &group(10), "80").unwrap());
    }

    #[test]
    fn error_uses_live_action_count() {
        // 3 errored of 8 remaining actions in a group sized 10.
        let cond = ThresholdErrorCondition::new(ledger(8, 0, 3));
        assert!(cond.evaluate(&rollout(), &group(10), "30").unwrap());
    }

    #[test]
    fn evaluate_rejects_bad_expression() {
        let cond = ThresholdSuccessCondition::new(ledger(10, 10, 0));
        assert!(cond
            .evaluate(&rollout(), &group(10), "lots")
            .unwrap_err()
            .is_configuration());
    }

    proptest! {
        #[test]
        fn empty_group_succeeds_for_every_threshold(threshold in 0u64..=100) {
            let cond = ThresholdSuccessCondition::new(ledger(0, 0, 0));
            prop_assert!(cond.evaluate(&rollout(), &group(0), &threshold.to_string()).unwrap());
        }

        #[test]
        fn empty_group_never_errors_for_any_threshold(threshold in 0u64..=100) {
            let cond = ThresholdErrorCondition::new(ledger(0, 0, 0));
            prop_assert!(!cond.evaluate(&rollout(), &group(10), &threshold.to_string()).unwrap());
        }

        #[test]
        fn thresholds_match_ratio(
            total in 1u64..10_000,
            share in 0u64..=10_000,
            threshold in 0u64..=100,
        ) {
            let count = total * share / 10_000;
            let ratio = count as f64 / total as f64;
            let limit = threshold as f64 / 100.0;
            // Skip boundary cases where float rounding is ambiguous.
            prop_assume!((ratio - limit).abs() > 1e-9 || count * 100 == threshold * total);
            prop_assert_eq!(success_threshold_reached(count, total, threshold), ratio >= limit);
            prop_assert_eq!(error_threshold_exceeded(count, total, threshold), ratio > limit);
        }
    }
}
