//! Evaluator registry — resolves evaluators by symbolic tag.
//!
//! Built once at startup and immutable afterwards. The four tag spaces are
//! disjoint, so each has its own table. [`RegistryBuilder::build`] refuses
//! to produce a registry that is missing any known tag.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use canopy_state::{ErrorAction, ErrorCondition, GroupConditions, SuccessAction, SuccessCondition};

use crate::actions::{ActionEvaluator, NextGroupAction, PauseOnErrorAction, PauseOnSuccessAction};
use crate::backend::{ActionLedger, ActionScheduler, RolloutRepository};
use crate::conditions::{ConditionEvaluator, ThresholdErrorCondition, ThresholdSuccessCondition};
use crate::error::{EngineError, EngineResult};

pub struct EvaluatorRegistry {
    success_conditions: HashMap<SuccessCondition, Arc<dyn ConditionEvaluator>>,
    error_conditions: HashMap<ErrorCondition, Arc<dyn ConditionEvaluator>>,
    success_actions: HashMap<SuccessAction, Arc<dyn ActionEvaluator>>,
    error_actions: HashMap<ErrorAction, Arc<dyn ActionEvaluator>>,
}

fn lookup<'a, K, V: ?Sized>(
    table: &'a HashMap<K, Arc<V>>,
    kind: &'static str,
    tag: K,
) -> EngineResult<&'a V>
where
    K: Eq + Hash + fmt::Display,
{
    table
        .get(&tag)
        .map(|evaluator| &**evaluator)
        .ok_or_else(|| EngineError::UnregisteredEvaluator {
            kind,
            tag: tag.to_string(),
        })
}

fn ensure_complete<K, V: ?Sized>(
    table: &HashMap<K, Arc<V>>,
    kind: &'static str,
    all: &[K],
) -> EngineResult<()>
where
    K: Copy + Eq + Hash + fmt::Display,
{
    match all.iter().find(|tag| !table.contains_key(*tag)) {
        Some(tag) => Err(EngineError::UnregisteredEvaluator {
            kind,
            tag: tag.to_string(),
        }),
        None => Ok(()),
    }
}

impl EvaluatorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with the built-in evaluators over one backend.
    pub fn with_defaults<B>(backend: Arc<B>) -> EngineResult<Self>
    where
        B: RolloutRepository + ActionLedger + ActionScheduler + 'static,
    {
        let repo: Arc<dyn RolloutRepository> = backend.clone();
        let ledger: Arc<dyn ActionLedger> = backend.clone();
        let scheduler: Arc<dyn ActionScheduler> = backend;

        Self::builder()
            .success_condition(
                SuccessCondition::Threshold,
                Arc::new(ThresholdSuccessCondition::new(ledger.clone())),
            )
            .error_condition(
                ErrorCondition::Threshold,
                Arc::new(ThresholdErrorCondition::new(ledger)),
            )
            .success_action(
                SuccessAction::NextGroup,
                Arc::new(NextGroupAction::new(repo.clone(), scheduler)),
            )
            .success_action(
                SuccessAction::Pause,
                Arc::new(PauseOnSuccessAction::new(repo.clone())),
            )
            .error_action(ErrorAction::Pause, Arc::new(PauseOnErrorAction::new(repo)))
            .build()
    }

    pub fn success_condition(&self, tag: SuccessCondition) -> EngineResult<&dyn ConditionEvaluator> {
        lookup(&self.success_conditions, "success condition", tag)
    }

    pub fn error_condition(&self, tag: ErrorCondition) -> EngineResult<&dyn ConditionEvaluator> {
        lookup(&self.error_conditions, "error condition", tag)
    }

    pub fn success_action(&self, tag: SuccessAction) -> EngineResult<&dyn ActionEvaluator> {
        lookup(&self.success_actions, "success action", tag)
    }

    pub fn error_action(&self, tag: ErrorAction) -> EngineResult<&dyn ActionEvaluator> {
        lookup(&self.error_actions, "error action", tag)
    }

    /// Check that every tag in `conditions` resolves and every condition
    /// expression is accepted by its evaluator.
    pub fn verify(&self, conditions: &GroupConditions) -> EngineResult<()> {
        self.success_condition(conditions.success_condition)?
            .verify_expression(&conditions.success_condition_exp)?;
        self.success_action(conditions.success_action)?;
        match (conditions.error_condition, conditions.error_action) {
            (Some(condition), Some(action)) => {
                self.error_condition(condition)?
                    .verify_expression(&conditions.error_condition_exp)?;
                self.error_action(action)?;
            }
            (None, Some(action)) => {
                self.error_action(action)?;
            }
            (Some(_), None) => {
                return Err(EngineError::Invalid(
                    "error condition configured without an error action".to_string(),
                ));
            }
            (None, None) => {}
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    success_conditions: HashMap<SuccessCondition, Arc<dyn ConditionEvaluator>>,
    error_conditions: HashMap<ErrorCondition, Arc<dyn ConditionEvaluator>>,
    success_actions: HashMap<SuccessAction, Arc<dyn ActionEvaluator>>,
    error_actions: HashMap<ErrorAction, Arc<dyn ActionEvaluator>>,
}

impl RegistryBuilder {
    pub fn success_condition(
        mut self,
        tag: SuccessCondition,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        self.success_conditions.insert(tag, evaluator);
        self
    }

    pub fn error_condition(mut self, tag: ErrorCondition, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.error_conditions.insert(tag, evaluator);
        self
    }

    pub fn success_action(mut self, tag: SuccessAction, evaluator: Arc<dyn ActionEvaluator>) -> Self {
        self.success_actions.insert(tag, evaluator);
        self
    }

    pub fn error_action(mut self, tag: ErrorAction, evaluator: Arc<dyn ActionEvaluator>) -> Self {
        self.error_actions.insert(tag, evaluator);
        self
    }

    /// Build, failing if any known tag has no evaluator.
    pub fn build(self) -> EngineResult<EvaluatorRegistry> {
        ensure_complete(&self.success_conditions, "success condition", SuccessCondition::ALL)?;
        ensure_complete(&self.error_conditions, "error condition", ErrorCondition::ALL)?;
        ensure_complete(&self.success_actions, "success action", SuccessAction::ALL)?;
        ensure_complete(&self.error_actions, "error action", ErrorAction::ALL)?;
        Ok(self.build_partial())
    }

    /// Build without the completeness check. Lookups of missing tags fail
    /// with `UnregisteredEvaluator` at evaluation time.
    pub fn build_partial(self) -> EvaluatorRegistry {
        EvaluatorRegistry {
            success_conditions: self.success_conditions,
            error_conditions: self.error_conditions,
            success_actions: self.success_actions,
            error_actions: self.error_actions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StoreBackend;
    use canopy_state::StateStore;

    fn backend() -> Arc<StoreBackend> {
        Arc::new(StoreBackend::new(StateStore::open_in_memory().unwrap(), 10))
    }

    #[test]
    fn defaults_cover_every_tag() {
        let registry = EvaluatorRegistry::with_defaults(backend()).unwrap();
        for tag in SuccessCondition::ALL {
            assert!(registry.success_condition(*tag).is_ok());
        }
        for tag in SuccessAction::ALL {
            assert!(registry.success_action(*tag).is_ok());
        }
        assert!(registry.error_condition(ErrorCondition::Threshold).is_ok());
        assert!(registry.error_action(ErrorAction::Pause).is_ok());
    }

    #[test]
    fn build_fails_fast_on_missing_tag() {
        let backend = backend();
        let err = EvaluatorRegistry::builder()
            .success_condition(
                SuccessCondition::Threshold,
                Arc::new(ThresholdSuccessCondition::new(backend.clone())),
            )
            .build()
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("error condition"));
    }

    #[test]
    fn partial_registry_reports_unregistered_tag() {
        let registry = EvaluatorRegistry::builder().build_partial();
        let err = registry.success_action(SuccessAction::Pause).err().unwrap();
        assert!(matches!(
            err,
            EngineError::UnregisteredEvaluator { ref tag, .. } if tag == "pause"
        ));
    }

    #[test]
    fn verify_checks_expressions() {
        let registry = EvaluatorRegistry::with_defaults(backend()).unwrap();
        assert!(registry.verify(&GroupConditions::thresholds(80, 20)).is_ok());

        let mut bad = GroupConditions::thresholds(80, 20);
        bad.error_condition_exp = "twenty".into();
        assert!(registry.verify(&bad).unwrap_err().is_configuration());

        let mut no_action = GroupConditions::thresholds(80, 20);
        no_action.error_action = None;
        assert!(matches!(
            registry.verify(&no_action).unwrap_err(),
            EngineError::Invalid(_)
        ));
    }
}
