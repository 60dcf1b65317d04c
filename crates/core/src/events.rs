use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in a run's audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events recorded during a transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        steps: Vec<StepId>,
        targets: Vec<TargetId>,
    },
    RunPlanned {
        plan: Vec<StepId>,
    },
    RunCompleted {
        duration_secs: u64,
    },
    RunFailed {
        step: Option<StepId>,
        target: Option<TargetId>,
        error: String,
        duration_secs: u64,
    },
    RunAborted {
        error: String,
    },
    RunCancelled {
        reason: String,
    },

    // Step lifecycle events
    StepStarted {
        step_id: StepId,
        targets: Vec<TargetId>,
    },
    StepCompleted {
        step_id: StepId,
        duration_ms: u64,
    },
    StepFailed {
        step_id: StepId,
        error: String,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },

    // Target events
    TargetChanged {
        step_id: StepId,
        target_id: TargetId,
        change: FieldChange,
    },
    TargetSaved {
        step_id: StepId,
        target_id: TargetId,
    },
    TargetFailed {
        step_id: StepId,
        target_id: TargetId,
        error: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}
