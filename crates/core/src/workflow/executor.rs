use super::dag::StepPlan;
use super::engagement::EngagedTargets;
use super::registry::StepRegistry;
use super::step::{
    FieldSchema, ParameterInputs, PendingContext, RawParams, StepDefinition, TargetBatch,
    TargetHandle,
};
use super::step_executor::{Dispatch, StepExecutor};
use crate::error::{ErrorKind, TransitionError, TransitionResult};
use crate::events::{Event, EventType};
use crate::services::Services;
use crate::types::{
    AbortReason, FailurePoint, RunId, RunReport, RunStatus, StepId, StepReport, StepStatus,
    TargetId, TargetKind, TargetOutcome, TargetStatus,
};
use anyhow::anyhow;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// A caller's request to run a transition
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub run_id: RunId,
    pub steps: Vec<StepId>,
    pub targets: Vec<TargetId>,
    pub params: ParameterInputs,
}

impl TransitionRequest {
    pub fn new<S, T>(steps: S, targets: T) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            run_id: RunId::new(),
            steps: steps.into_iter().map(StepId::new).collect(),
            targets: targets.into_iter().map(TargetId::new).collect(),
            params: ParameterInputs::new(),
        }
    }

    /// Supply one raw form value for a step parameter
    pub fn with_param(
        mut self,
        step: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.params
            .entry(StepId::new(step))
            .or_default()
            .insert(name.into(), value.into());
        self
    }
}

/// Drives a run: plan, engage targets, dispatch steps, aggregate results
pub struct TransitionCoordinator {
    registry: Arc<StepRegistry>,
    services: Services,
    step_executor: Arc<StepExecutor>,
    engaged: Arc<EngagedTargets>,
    // Track active runs for cancellation
    active_runs: Arc<RwLock<HashMap<RunId, watch::Sender<bool>>>>,
}

/// Mutable bookkeeping of one run while its plan executes
struct RunState {
    reports: HashMap<StepId, StepReport>,
    outstanding: HashMap<StepId, (JoinHandle<StepReport>, Vec<TargetId>)>,
    active: Vec<TargetId>,
    blocked: HashSet<StepId>,
    first_failure: Option<FailurePoint>,
    halted: bool,
}

impl RunState {
    /// Fold a finished step report into the run
    fn record(&mut self, step: &StepDefinition, report: StepReport) {
        match report.status {
            StepStatus::Skipped => {
                self.blocked.insert(step.id.clone());
            }
            StepStatus::Failed => {
                // Dependents still run for the targets that succeeded
                let any_succeeded = report
                    .targets
                    .values()
                    .any(|outcome| outcome.status == TargetStatus::Success);
                if !any_succeeded {
                    self.blocked.insert(step.id.clone());
                }
                let failed = report.failed_targets();
                self.active.retain(|id| !failed.contains(id));

                if self.first_failure.is_none() {
                    let (target, message) = match report.first_failure() {
                        Some((target, message)) => (Some(target), message),
                        None => (None, report.error.clone().unwrap_or_default()),
                    };
                    self.first_failure = Some(FailurePoint {
                        step: Some(step.id.clone()),
                        target,
                        message,
                    });
                }

                let disabled = report.error_kind == Some(ErrorKind::IntegrationDisabled);
                if step.fatal_on_failure || disabled {
                    tracing::error!(step = %step.id, "Step failed, no further steps will be scheduled");
                    self.halted = true;
                }
            }
            _ => {}
        }
        self.reports.insert(step.id.clone(), report);
    }
}

impl TransitionCoordinator {
    pub fn new(registry: Arc<StepRegistry>, services: Services) -> Self {
        Self::with_engagement(registry, services, Arc::new(EngagedTargets::new()))
    }

    /// Share target engagement with other coordinators in the process
    pub fn with_engagement(
        registry: Arc<StepRegistry>,
        services: Services,
        engaged: Arc<EngagedTargets>,
    ) -> Self {
        let step_executor = Arc::new(StepExecutor::new(services.clone()));
        Self {
            registry,
            services,
            step_executor,
            engaged,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Build the execution plan for a selection
    pub fn plan(&self, steps: &[StepId]) -> TransitionResult<StepPlan> {
        StepPlan::build(&self.registry, steps)
    }

    /// Parameter schema of a step for a batch, as the form layer renders it
    pub async fn describe_params(
        &self,
        step: &StepId,
        selection: &[StepId],
        targets: &[TargetId],
    ) -> TransitionResult<Vec<FieldSchema>> {
        let definition = self.registry.get(step)?;
        let loaded = self
            .services
            .assets
            .load(targets)
            .await
            .map_err(TransitionError::from_collaborator)?;
        let pending = PendingContext::new(selection.to_vec());

        Ok(definition
            .params
            .iter()
            .map(|p| p.describe(&pending, &loaded))
            .collect())
    }

    /// Execute a transition and return its report.
    ///
    /// Planning failures come back as an aborted report; `Err` is reserved
    /// for runs that could not start (busy or unknown targets).
    pub async fn run(&self, request: TransitionRequest) -> TransitionResult<RunReport> {
        let run_id = request.run_id;
        let started_at = Utc::now();

        tracing::info!("Starting transition: run_id={}", run_id);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active_runs.write().await.insert(run_id, cancel_tx);

        let result = self.run_inner(&request, started_at, cancel_rx).await;

        // Clean up active runs
        self.active_runs.write().await.remove(&run_id);

        result
    }

    async fn run_inner(
        &self,
        request: &TransitionRequest,
        started_at: chrono::DateTime<Utc>,
        cancel_rx: watch::Receiver<bool>,
    ) -> TransitionResult<RunReport> {
        let run_id = request.run_id;
        let mut report = RunReport {
            run_id,
            status: RunStatus::Planning,
            abort_reason: None,
            plan: Vec::new(),
            steps: Vec::new(),
            first_failure: None,
            started_at,
            completed_at: None,
        };

        let mut target_ids: Vec<TargetId> = Vec::new();
        for id in &request.targets {
            if !target_ids.contains(id) {
                target_ids.push(id.clone());
            }
        }

        self.emit(Event::new(
            run_id,
            EventType::RunStarted {
                steps: request.steps.clone(),
                targets: target_ids.clone(),
            },
        ))
        .await?;

        // PLANNING
        let plan = match self.build_plan(&request.steps, &target_ids) {
            Ok(plan) => plan,
            Err(err) => return self.abort(report, err).await,
        };
        report.plan = plan.step_ids();

        let _engagement = self.engaged.engage(&target_ids)?;
        let targets = self
            .services
            .assets
            .load(&target_ids)
            .await
            .map_err(TransitionError::from_collaborator)?;

        let kinds: BTreeSet<TargetKind> = targets.iter().map(|t| t.kind).collect();
        if let Some(step) = plan
            .steps()
            .iter()
            .find(|step| kinds.iter().any(|kind| !step.supports(*kind)))
        {
            let err = TransitionError::InvalidPlan(format!(
                "step {} does not apply to every target kind in the batch",
                step.id
            ));
            return self.abort(report, err).await;
        }

        self.emit(Event::new(
            run_id,
            EventType::RunPlanned {
                plan: report.plan.clone(),
            },
        ))
        .await?;

        // RUNNING
        report.status = RunStatus::Running;
        tracing::info!(run_id = %run_id, plan = ?report.plan, "Transition planned");

        let handles: HashMap<TargetId, TargetHandle> = targets
            .into_iter()
            .map(|t| (t.id.clone(), TargetHandle::new(t)))
            .collect();

        let (state, cancelled) = self
            .execute_plan(run_id, &plan, &request.params, handles, target_ids, cancel_rx)
            .await;

        let duration = (Utc::now() - started_at).num_seconds().max(0) as u64;
        report.steps = plan
            .step_ids()
            .into_iter()
            .map(|id| {
                state
                    .reports
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| StepReport::pending(id))
            })
            .collect();
        report.first_failure = state.first_failure;
        report.completed_at = Some(Utc::now());

        if cancelled {
            report.status = RunStatus::Cancelled;
            tracing::warn!("Transition cancelled: run_id={}", run_id);
        } else if let Some(failure) = &report.first_failure {
            report.status = RunStatus::Failed;
            tracing::error!(
                "Transition failed: run_id={}, step={:?}, target={:?}, error={}",
                run_id,
                failure.step,
                failure.target,
                failure.message
            );
            self.emit(Event::new(
                run_id,
                EventType::RunFailed {
                    step: failure.step.clone(),
                    target: failure.target.clone(),
                    error: failure.message.clone(),
                    duration_secs: duration,
                },
            ))
            .await?;
        } else {
            report.status = RunStatus::Completed;
            tracing::info!("Transition completed: run_id={}", run_id);
            self.emit(Event::new(
                run_id,
                EventType::RunCompleted {
                    duration_secs: duration,
                },
            ))
            .await?;
        }

        Ok(report)
    }

    fn build_plan(&self, steps: &[StepId], targets: &[TargetId]) -> TransitionResult<StepPlan> {
        if steps.is_empty() {
            return Err(TransitionError::InvalidPlan("no steps selected".to_string()));
        }
        if targets.is_empty() {
            return Err(TransitionError::InvalidPlan("no targets selected".to_string()));
        }
        StepPlan::build(&self.registry, steps)
    }

    async fn abort(&self, mut report: RunReport, err: TransitionError) -> TransitionResult<RunReport> {
        tracing::error!("Transition aborted during planning: run_id={}, error={}", report.run_id, err);

        report.status = RunStatus::Aborted;
        report.abort_reason = Some(match err {
            TransitionError::CyclicDependency { .. } => AbortReason::Cycle,
            _ => AbortReason::InvalidPlan,
        });
        report.first_failure = Some(FailurePoint {
            step: match &err {
                TransitionError::UnknownStep(id) => Some(id.clone()),
                TransitionError::CyclicDependency { cycle } => cycle.first().cloned(),
                _ => None,
            },
            target: None,
            message: err.to_string(),
        });
        report.completed_at = Some(Utc::now());

        self.emit(Event::new(
            report.run_id,
            EventType::RunAborted {
                error: err.to_string(),
            },
        ))
        .await?;

        Ok(report)
    }

    /// Execute the plan in order, holding back dependents of outstanding
    /// asynchronous steps until those report completion
    async fn execute_plan(
        &self,
        run_id: RunId,
        plan: &StepPlan,
        inputs: &ParameterInputs,
        handles: HashMap<TargetId, TargetHandle>,
        target_order: Vec<TargetId>,
        cancel_rx: watch::Receiver<bool>,
    ) -> (RunState, bool) {
        let pending = PendingContext::new(plan.step_ids());
        let empty = RawParams::new();
        let mut cancelled_before: Option<StepId> = None;
        let mut state = RunState {
            reports: HashMap::new(),
            outstanding: HashMap::new(),
            active: target_order,
            blocked: HashSet::new(),
            first_failure: None,
            halted: false,
        };

        for step in plan.steps() {
            // Cooperative cancellation checkpoint
            if *cancel_rx.borrow() {
                tracing::warn!("Transition cancelled before step {}: run_id={}", step.id, run_id);
                cancelled_before = Some(step.id.clone());
                break;
            }

            // A fatal asynchronous failure stops the run even without a dependent
            self.reap_finished(plan, &mut state).await;
            if state.halted {
                break;
            }

            let deps = plan.dependencies(&step.id).unwrap_or_default();
            for dep in &deps {
                if let Some((handle, ids)) = state.outstanding.remove(dep) {
                    tracing::debug!(step = %step.id, waiting_for = %dep, "Waiting for asynchronous predecessor");
                    let report = join_report(dep, handle, &ids).await;
                    if let Ok(dep_step) = self.registry.get(dep) {
                        state.record(&dep_step, report);
                    }
                }
            }

            if state.halted {
                break;
            }

            if let Some(dep) = deps.iter().find(|d| state.blocked.contains(*d)) {
                let reason = format!("Dependency {} did not complete", dep);
                self.skip(run_id, &step, &mut state, &reason).await;
                continue;
            }

            if state.active.is_empty() {
                self.skip(run_id, &step, &mut state, "No targets left in the batch").await;
                continue;
            }

            let batch = TargetBatch::from_handles(
                state
                    .active
                    .iter()
                    .filter_map(|id| handles.get(id).cloned())
                    .collect(),
            );
            let raw = inputs.get(&step.id).unwrap_or(&empty);

            match self
                .step_executor
                .execute(run_id, step.clone(), batch, raw, &pending)
                .await
            {
                Dispatch::Finished(report) => state.record(&step, report),
                Dispatch::Pending(handle) => {
                    state
                        .outstanding
                        .insert(step.id.clone(), (handle, state.active.clone()));
                }
            }

            if state.halted {
                break;
            }
        }

        // In-flight asynchronous steps always report their terminal result
        for step in plan.steps() {
            if let Some((handle, ids)) = state.outstanding.remove(&step.id) {
                let report = join_report(&step.id, handle, &ids).await;
                state.record(&step, report);
            }
        }

        let cancelled = cancelled_before.is_some();
        if state.first_failure.is_none() {
            state.first_failure = cancelled_before.map(|step| FailurePoint {
                step: Some(step),
                target: None,
                message: TransitionError::Cancelled.to_string(),
            });
        }

        (state, cancelled)
    }

    /// Record asynchronous steps that already reported, in plan order
    async fn reap_finished(&self, plan: &StepPlan, state: &mut RunState) {
        for step in plan.steps() {
            let finished = state
                .outstanding
                .get(&step.id)
                .is_some_and(|(handle, _)| handle.is_finished());
            if !finished {
                continue;
            }
            if let Some((handle, ids)) = state.outstanding.remove(&step.id) {
                let report = join_report(&step.id, handle, &ids).await;
                state.record(&step, report);
            }
        }
    }

    async fn skip(&self, run_id: RunId, step: &StepDefinition, state: &mut RunState, reason: &str) {
        tracing::info!("Skipping step {}: {}", step.id, reason);
        let report = StepReport::skipped(step.id.clone(), &state.active, reason);
        super::step_executor::append(
            &self.services.event_log,
            Event::new(
                run_id,
                EventType::StepSkipped {
                    step_id: step.id.clone(),
                    reason: reason.to_string(),
                },
            ),
        )
        .await;
        state.record(step, report);
    }

    async fn emit(&self, event: Event) -> TransitionResult<()> {
        self.services
            .event_log
            .append(event)
            .await
            .map_err(TransitionError::Other)
    }

    /// Whether a run is still in flight
    pub async fn is_active(&self, run_id: RunId) -> bool {
        self.active_runs.read().await.contains_key(&run_id)
    }

    /// Request cancellation of a running transition; takes effect before the next step
    pub async fn cancel(&self, run_id: RunId) -> TransitionResult<()> {
        let active_runs = self.active_runs.read().await;

        if let Some(cancel_tx) = active_runs.get(&run_id) {
            cancel_tx.send(true).ok();
            tracing::info!("Cancellation signal sent for run {}", run_id);

            self.emit(Event::new(
                run_id,
                EventType::RunCancelled {
                    reason: "User requested cancellation".to_string(),
                },
            ))
            .await?;

            Ok(())
        } else {
            Err(TransitionError::Other(anyhow!("Run {} is not active", run_id)))
        }
    }
}

/// Await an asynchronous step; a panicked worker fails the step for its batch
async fn join_report(
    step: &StepId,
    handle: JoinHandle<StepReport>,
    targets: &[TargetId],
) -> StepReport {
    match handle.await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(step = %step, error = %err, "Asynchronous step worker failed");
            let message = format!("Asynchronous step worker failed: {}", err);
            let mut report = StepReport::pending(step.clone());
            report.status = StepStatus::Failed;
            report.error = Some(message.clone());
            report.error_kind = Some(ErrorKind::Runtime);
            report.completed_at = Some(Utc::now());
            report.targets = targets
                .iter()
                .map(|id| (id.clone(), TargetOutcome::failed(message.clone())))
                .collect();
            report
        }
    }
}
