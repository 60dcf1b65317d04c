use super::step::StepDefinition;
use crate::error::{TransitionError, TransitionResult};
use crate::types::{StepId, TargetKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Collects step definitions before the registry is frozen
#[derive(Debug, Default)]
pub struct StepRegistryBuilder {
    steps: Vec<Arc<StepDefinition>>,
    index: HashMap<StepId, usize>,
}

impl StepRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step; names are unique
    pub fn register(&mut self, step: StepDefinition) -> TransitionResult<&mut Self> {
        if self.index.contains_key(&step.id) {
            return Err(TransitionError::DuplicateStep(step.id));
        }
        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(Arc::new(step));
        Ok(self)
    }

    /// Freeze the catalog. Every `run_after` name must be registered.
    pub fn build(self) -> TransitionResult<StepRegistry> {
        for step in &self.steps {
            if let Some(missing) = step
                .run_after
                .iter()
                .find(|dep| !self.index.contains_key(*dep))
            {
                tracing::error!(step = %step.id, missing = %missing, "run_after references unknown step");
                return Err(TransitionError::UnknownStep(missing.clone()));
            }
        }

        tracing::debug!(steps = self.steps.len(), "step registry built");

        Ok(StepRegistry {
            steps: self.steps,
            index: self.index,
        })
    }
}

/// Read-only catalog of steps, in registration order
#[derive(Debug)]
pub struct StepRegistry {
    steps: Vec<Arc<StepDefinition>>,
    index: HashMap<StepId, usize>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::new()
    }

    /// Get a step by name
    pub fn get(&self, id: &StepId) -> TransitionResult<Arc<StepDefinition>> {
        self.index
            .get(id)
            .map(|&i| self.steps[i].clone())
            .ok_or_else(|| TransitionError::UnknownStep(id.clone()))
    }

    /// Registration index of a step
    pub fn position(&self, id: &StepId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Steps that support every kind present in the batch
    pub fn filter_applicable(&self, kinds: &[TargetKind]) -> Vec<Arc<StepDefinition>> {
        self.steps
            .iter()
            .filter(|step| kinds.iter().all(|kind| step.supports(*kind)))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StepDefinition>> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::{StepAction, StepContext, StepParams, TargetBatch, TargetFailures};

    struct Noop;

    #[async_trait::async_trait]
    impl StepAction for Noop {
        async fn run(
            &self,
            _ctx: &StepContext,
            _batch: &TargetBatch,
            _params: &StepParams,
        ) -> anyhow::Result<TargetFailures> {
            Ok(TargetFailures::new())
        }
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut builder = StepRegistry::builder();
        builder.register(StepDefinition::new("a", "A", Noop)).unwrap();
        let err = builder
            .register(StepDefinition::new("a", "A again", Noop))
            .unwrap_err();
        assert!(matches!(err, TransitionError::DuplicateStep(id) if id.0 == "a"));
    }

    #[test]
    fn test_unknown_step_lookup() {
        let registry = StepRegistry::builder().build().unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get(&StepId::new("missing")),
            Err(TransitionError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_missing_run_after_rejected_at_build() {
        let mut builder = StepRegistry::builder();
        builder
            .register(StepDefinition::new("b", "B", Noop).run_after(["a"]))
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(TransitionError::UnknownStep(id)) if id.0 == "a"
        ));
    }

    #[test]
    fn test_filter_applicable_by_kind() {
        let mut builder = StepRegistry::builder();
        builder
            .register(StepDefinition::new("both", "Both", Noop))
            .unwrap()
            .register(
                StepDefinition::new("physical", "Physical only", Noop)
                    .for_kinds([TargetKind::DataCenterAsset]),
            )
            .unwrap();
        let registry = builder.build().unwrap();

        let names = |kinds: &[TargetKind]| -> Vec<String> {
            registry
                .filter_applicable(kinds)
                .iter()
                .map(|s| s.id.0.clone())
                .collect()
        };

        assert_eq!(names(&[TargetKind::DataCenterAsset]), vec!["both", "physical"]);
        assert_eq!(names(&[TargetKind::VirtualServer]), vec!["both"]);
        assert_eq!(
            names(&[TargetKind::DataCenterAsset, TargetKind::VirtualServer]),
            vec!["both"]
        );
        assert_eq!(registry.position(&StepId::new("physical")), Some(1));
    }
}
