// Transition orchestration: step catalog, dependency planning and execution

pub mod dag;
pub mod engagement;
pub mod executor;
pub mod registry;
pub mod step;
pub mod step_executor;

pub use dag::StepPlan;
pub use engagement::{EngagedTargets, Engagement};
pub use executor::{TransitionCoordinator, TransitionRequest};
pub use registry::{StepRegistry, StepRegistryBuilder};
pub use step::{
    ExecutionMode, FieldSchema, ParamSpec, ParamValue, ParameterInputs, PendingContext,
    RawParams, StepAction, StepContext, StepDefinition, StepParams, TargetBatch, TargetFailures,
    TargetHandle,
};
pub use step_executor::{Dispatch, StepExecutor};
