// Core of the provisioning transition engine

pub mod deployment;
pub mod error;
pub mod events;
pub mod resolver;
pub mod services;
pub mod storage;
pub mod types;
pub mod workflow;

pub use error::{ErrorKind, IntegrationDisabled, TransitionError, TransitionResult};
pub use services::Services;
pub use types::*;
