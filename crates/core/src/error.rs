// Error types for transition orchestration

use crate::types::{StepId, TargetId};
use serde::{Deserialize, Serialize};

/// Result type for transition operations.
pub type TransitionResult<T> = Result<T, TransitionError>;

/// Marker error returned by a collaborator whose integration is switched off
/// in this deployment. The core propagates it instead of treating it as a
/// per-target failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} integration is not enabled")]
pub struct IntegrationDisabled(pub String);

/// Errors that can occur while planning or running a transition.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransitionError {
    /// A step name was registered twice.
    #[error("Duplicate step: {0}")]
    DuplicateStep(StepId),

    /// A step name is not in the registry.
    #[error("Unknown step: {0}")]
    UnknownStep(StepId),

    /// The selected steps contain a `run_after` cycle.
    #[error("Cyclic dependency between steps: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<StepId> },

    /// The selection cannot form a plan for this batch.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// A step precondition rejected the batch.
    #[error("Precondition failed for step {step}: {message}")]
    Precondition { step: StepId, message: String },

    /// A raw parameter value failed validation.
    #[error("Invalid value for {step}.{param}: {message}")]
    InvalidParameter {
        step: StepId,
        param: String,
        message: String,
    },

    /// An external integration is disabled.
    #[error("Integration disabled: {0}")]
    IntegrationDisabled(#[from] IntegrationDisabled),

    /// A step body failed for one target.
    #[error("Step failed for target {target}: {message}")]
    TargetExecution { target: TargetId, message: String },

    /// A target is already engaged by another in-flight run.
    #[error("Target {0} is already engaged in a running transition")]
    TargetBusy(TargetId),

    /// The asset store does not know a requested target.
    #[error("Target not found: {0}")]
    TargetNotFound(TargetId),

    /// The run was cancelled before the next step could start.
    #[error("Transition cancelled")]
    Cancelled,

    /// Collaborator or runtime failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`TransitionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Precondition,
    ParameterValidation,
    IntegrationDisabled,
    TargetExecution,
    Runtime,
}

impl TransitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateStep(_)
            | Self::UnknownStep(_)
            | Self::CyclicDependency { .. }
            | Self::InvalidPlan(_) => ErrorKind::Configuration,
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::InvalidParameter { .. } => ErrorKind::ParameterValidation,
            Self::IntegrationDisabled(_) => ErrorKind::IntegrationDisabled,
            Self::TargetExecution { .. } => ErrorKind::TargetExecution,
            Self::TargetBusy(_) | Self::TargetNotFound(_) | Self::Cancelled | Self::Other(_) => {
                ErrorKind::Runtime
            }
        }
    }

    /// Classify a collaborator error, lifting a disabled integration out of it
    pub fn from_collaborator(error: anyhow::Error) -> Self {
        let disabled = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<IntegrationDisabled>())
            .cloned();
        match disabled {
            Some(disabled) => Self::IntegrationDisabled(disabled),
            None => Self::Other(error),
        }
    }
}

/// True when a collaborator error is (or wraps) [`IntegrationDisabled`]
pub fn is_integration_disabled(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<IntegrationDisabled>())
}

fn format_cycle(cycle: &[StepId]) -> String {
    cycle
        .iter()
        .map(|s| s.0.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_cycle_display_names_steps() {
        let error = TransitionError::CyclicDependency {
            cycle: vec![StepId::new("a"), StepId::new("b")],
        };
        assert_eq!(error.to_string(), "Cyclic dependency between steps: a -> b");
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_disabled_integration_survives_context() {
        let error: anyhow::Error = Err::<(), _>(IntegrationDisabled("DNS".to_string()))
            .context("listing records")
            .unwrap_err();
        assert!(is_integration_disabled(&error));

        let classified = TransitionError::from_collaborator(anyhow::Error::new(
            IntegrationDisabled("DNS".to_string()),
        ));
        assert_eq!(classified.kind(), ErrorKind::IntegrationDisabled);
    }

    #[test]
    fn test_plain_collaborator_error_is_runtime() {
        let classified = TransitionError::from_collaborator(anyhow::anyhow!("timeout"));
        assert_eq!(classified.kind(), ErrorKind::Runtime);
        assert_eq!(classified.to_string(), "timeout");
    }

    #[test]
    fn test_parameter_error_display() {
        let error = TransitionError::InvalidParameter {
            step: StepId::new("assign_new_hostname"),
            param: "hostname".to_string(),
            message: "not an allowed choice".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid value for assign_new_hostname.hostname: not an allowed choice"
        );
    }
}
