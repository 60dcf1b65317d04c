// Step definitions and the batch handles a step body operates on

use crate::error::is_integration_disabled;
use crate::services::Services;
use crate::types::{Choice, RunId, StepId, Target, TargetId, TargetKind};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Choice key that switches a field to its free-form "other" value
pub const OTHER: &str = "__other__";

/// Suffix of the raw input key carrying the literal for an "other" choice
pub const OTHER_SUFFIX: &str = "__other";

/// Computes the allowed values of a field for a batch
pub type ChoicesFn = fn(&PendingContext, &[Target]) -> Vec<Choice>;

/// Computes a default value of a field for a batch
pub type DefaultFn = fn(&PendingContext, &[Target]) -> Option<String>;

/// Returns an error message for every target that fails the check
pub type PreconditionFn = fn(&[Target]) -> BTreeMap<TargetId, String>;

/// Validates the literal given for an "other" choice
pub type OtherValidator = fn(&str) -> Result<(), String>;

/// Raw form input of one step, keyed by field name
pub type RawParams = BTreeMap<String, String>;

/// Raw form input of a whole transition, keyed by step
pub type ParameterInputs = BTreeMap<StepId, RawParams>;

/// Per-target failures reported by a step body
pub type TargetFailures = BTreeMap<TargetId, String>;

/// The steps selected for the transition being prepared
#[derive(Debug, Clone, Default)]
pub struct PendingContext {
    pub steps: Vec<StepId>,
}

impl PendingContext {
    pub fn new(steps: Vec<StepId>) -> Self {
        Self { steps }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sync,
    Async,
}

/// How a field is rendered and validated
#[derive(Clone, Copy)]
pub enum FieldKind {
    Choice,
    /// Choice list that may also accept a validated literal
    ChoiceWithOther { validate: OtherValidator },
    Text,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            FieldKind::Choice => "choice",
            FieldKind::ChoiceWithOther { .. } => "choice_with_other",
            FieldKind::Text => "text",
        }
    }
}

/// Where a field gets its allowed or default value from
#[derive(Clone)]
pub enum ValueSource {
    None,
    Static(Vec<Choice>),
    Choices(ChoicesFn),
    Default(DefaultFn),
}

/// Declared parameter of a step
#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    pub source: ValueSource,
}

impl ParamSpec {
    pub fn choice(name: impl Into<String>, label: impl Into<String>, choices: ChoicesFn) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind: FieldKind::Choice,
            source: ValueSource::Choices(choices),
        }
    }

    pub fn static_choice(
        name: impl Into<String>,
        label: impl Into<String>,
        choices: Vec<Choice>,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind: FieldKind::Choice,
            source: ValueSource::Static(choices),
        }
    }

    pub fn text(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind: FieldKind::Text,
            source: ValueSource::None,
        }
    }

    pub fn with_default(mut self, default: DefaultFn) -> Self {
        self.source = ValueSource::Default(default);
        self
    }

    /// Accept a literal validated by `validate` when the "other" choice is offered
    pub fn with_other(mut self, validate: OtherValidator) -> Self {
        self.kind = FieldKind::ChoiceWithOther { validate };
        self
    }

    /// Allowed values for this batch, if the field is choice-driven
    pub fn choices(&self, pending: &PendingContext, targets: &[Target]) -> Option<Vec<Choice>> {
        match &self.source {
            ValueSource::Static(choices) => Some(choices.clone()),
            ValueSource::Choices(compute) => Some(compute(pending, targets)),
            ValueSource::None | ValueSource::Default(_) => None,
        }
    }

    /// Computed default for this batch
    pub fn default_value(&self, pending: &PendingContext, targets: &[Target]) -> Option<String> {
        match &self.source {
            ValueSource::Default(compute) => compute(pending, targets),
            _ => None,
        }
    }

    /// Schema handed to the form layer
    pub fn describe(&self, pending: &PendingContext, targets: &[Target]) -> FieldSchema {
        let choices = self.choices(pending, targets);
        let allows_other = matches!(self.kind, FieldKind::ChoiceWithOther { .. })
            && choices
                .as_ref()
                .is_some_and(|c| c.iter().any(|choice| choice.key == OTHER));
        FieldSchema {
            name: self.name.clone(),
            label: self.label.clone(),
            kind: self.kind.name().to_string(),
            choices,
            default: self.default_value(pending, targets),
            allows_other,
        }
    }
}

/// Field description consumed by the form/presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub label: String,
    pub kind: String,
    pub choices: Option<Vec<Choice>>,
    pub default: Option<String>,
    pub allows_other: bool,
}

/// A validated parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// Key of an offered choice
    Choice(String),
    /// Literal accepted through the "other" option
    Other(String),
    Text(String),
}

impl ParamValue {
    pub fn as_str(&self) -> &str {
        match self {
            ParamValue::Choice(v) | ParamValue::Other(v) | ParamValue::Text(v) => v,
        }
    }
}

/// Resolved parameters handed to a step body
#[derive(Debug, Clone, Default)]
pub struct StepParams(BTreeMap<String, ParamValue>);

impl StepParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn require(&self, name: &str) -> anyhow::Result<&ParamValue> {
        self.get(name)
            .ok_or_else(|| anyhow!("Missing parameter {}", name))
    }
}

/// Everything a step body may reach while running
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub step_id: StepId,
    pub services: Services,
}

/// Body of a step. Implementations isolate per-target failures themselves and
/// report them in the returned map; an `Err` aborts the step for the batch.
#[async_trait::async_trait]
pub trait StepAction: Send + Sync {
    async fn run(
        &self,
        ctx: &StepContext,
        batch: &TargetBatch,
        params: &StepParams,
    ) -> anyhow::Result<TargetFailures>;
}

/// Shared, lockable handle to one target of a run
#[derive(Clone)]
pub struct TargetHandle {
    id: TargetId,
    inner: Arc<Mutex<Target>>,
}

impl TargetHandle {
    pub fn new(target: Target) -> Self {
        Self {
            id: target.id.clone(),
            inner: Arc::new(Mutex::new(target)),
        }
    }

    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, Target> {
        self.inner.lock().await
    }

    pub async fn snapshot(&self) -> Target {
        self.inner.lock().await.clone()
    }
}

/// The targets a step runs against
#[derive(Clone, Default)]
pub struct TargetBatch {
    handles: Vec<TargetHandle>,
}

impl TargetBatch {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            handles: targets.into_iter().map(TargetHandle::new).collect(),
        }
    }

    pub fn from_handles(handles: Vec<TargetHandle>) -> Self {
        Self { handles }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetHandle> {
        self.handles.iter()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn ids(&self) -> Vec<TargetId> {
        self.handles.iter().map(|h| h.id.clone()).collect()
    }

    /// Clone of every target, in batch order
    pub async fn snapshot(&self) -> Vec<Target> {
        let mut targets = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            targets.push(handle.snapshot().await);
        }
        targets
    }
}

/// Record a per-target failure, or propagate it when the integration is disabled
pub fn record_failure(
    failures: &mut TargetFailures,
    target: &TargetId,
    error: anyhow::Error,
) -> anyhow::Result<()> {
    if is_integration_disabled(&error) {
        return Err(error);
    }
    tracing::error!(target_id = %target, error = %error, "step failed for target");
    failures.insert(target.clone(), format!("{:#}", error));
    Ok(())
}

/// Immutable description of a step, registered once at startup
pub struct StepDefinition {
    pub id: StepId,
    pub label: String,
    pub run_after: Vec<StepId>,
    pub mode: ExecutionMode,
    pub params: Vec<ParamSpec>,
    pub precondition: Option<PreconditionFn>,
    /// The body persists what it changes; no automatic save afterwards
    pub disable_save_object: bool,
    /// A per-target failure halts the whole run
    pub fatal_on_failure: bool,
    pub target_kinds: Vec<TargetKind>,
    pub action: Arc<dyn StepAction>,
}

impl StepDefinition {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        action: impl StepAction + 'static,
    ) -> Self {
        Self {
            id: StepId::new(id),
            label: label.into(),
            run_after: Vec::new(),
            mode: ExecutionMode::Sync,
            params: Vec::new(),
            precondition: None,
            disable_save_object: false,
            fatal_on_failure: true,
            target_kinds: vec![TargetKind::DataCenterAsset, TargetKind::VirtualServer],
            action: Arc::new(action),
        }
    }

    pub fn run_after<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_after = steps.into_iter().map(StepId::new).collect();
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.mode = ExecutionMode::Async;
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn precondition(mut self, check: PreconditionFn) -> Self {
        self.precondition = Some(check);
        self
    }

    pub fn disable_save_object(mut self) -> Self {
        self.disable_save_object = true;
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.fatal_on_failure = false;
        self
    }

    pub fn for_kinds(mut self, kinds: impl IntoIterator<Item = TargetKind>) -> Self {
        self.target_kinds = kinds.into_iter().collect();
        self
    }

    pub fn is_async(&self) -> bool {
        self.mode == ExecutionMode::Async
    }

    pub fn supports(&self, kind: TargetKind) -> bool {
        self.target_kinds.contains(&kind)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("run_after", &self.run_after)
            .field("mode", &self.mode)
            .field(
                "params",
                &self.params.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            )
            .field("disable_save_object", &self.disable_save_object)
            .field("fatal_on_failure", &self.fatal_on_failure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn two_choices(_: &PendingContext, _: &[Target]) -> Vec<Choice> {
        vec![Choice::new("a", "A"), Choice::new(OTHER, "Other")]
    }

    fn accept_all(_: &str) -> Result<(), String> {
        Ok(())
    }

    #[test]
    fn test_definition_builder_defaults() {
        let step = StepDefinition::new("noop", "No-op", Noop);
        assert_eq!(step.mode, ExecutionMode::Sync);
        assert!(step.fatal_on_failure);
        assert!(!step.disable_save_object);
        assert!(step.supports(TargetKind::VirtualServer));

        let step = step
            .run_after(["a", "b"])
            .asynchronous()
            .disable_save_object()
            .for_kinds([TargetKind::DataCenterAsset]);
        assert!(step.is_async());
        assert_eq!(step.run_after, vec![StepId::new("a"), StepId::new("b")]);
        assert!(!step.supports(TargetKind::VirtualServer));
    }

    #[test]
    fn test_describe_reports_other_option() {
        let param = ParamSpec::choice("ip", "IP", two_choices).with_other(accept_all);
        let schema = param.describe(&PendingContext::default(), &[]);
        assert_eq!(schema.kind, "choice_with_other");
        assert!(schema.allows_other);
        assert_eq!(schema.choices.unwrap().len(), 2);

        let plain = ParamSpec::choice("ip", "IP", two_choices);
        assert!(!plain.describe(&PendingContext::default(), &[]).allows_other);
    }

    #[tokio::test]
    async fn test_batch_snapshot_keeps_order() {
        let batch = TargetBatch::new(vec![
            Target::new("b", TargetKind::VirtualServer),
            Target::new("a", TargetKind::VirtualServer),
        ]);
        batch.iter().next().unwrap().lock().await.hostname = Some("b.local".to_string());

        let snapshot = batch.snapshot().await;
        assert_eq!(snapshot[0].id, TargetId::new("b"));
        assert_eq!(snapshot[0].hostname.as_deref(), Some("b.local"));
        assert_eq!(batch.ids(), vec![TargetId::new("b"), TargetId::new("a")]);
    }

    #[test]
    fn test_record_failure_propagates_disabled_integration() {
        let mut failures = TargetFailures::new();
        let id = TargetId::new("a");

        record_failure(&mut failures, &id, anyhow!("boom")).unwrap();
        assert_eq!(failures.get(&id).map(String::as_str), Some("boom"));

        let disabled = anyhow::Error::new(crate::error::IntegrationDisabled("DNS".into()));
        assert!(record_failure(&mut failures, &id, disabled).is_err());
    }
}
