use super::step::{
    FieldKind, ParamValue, PendingContext, RawParams, StepContext, StepDefinition, StepParams,
    TargetBatch, OTHER, OTHER_SUFFIX,
};
use crate::error::{is_integration_disabled, ErrorKind, TransitionError};
use crate::events::{Event, EventLog, EventType};
use crate::services::Services;
use crate::types::{RunId, StepReport, StepStatus, Target, TargetId, TargetOutcome};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// What `execute` hands back to the coordinator
pub enum Dispatch {
    /// The step ran to completion (or never started its body)
    Finished(StepReport),
    /// An asynchronous body is still running on the worker pool
    Pending(JoinHandle<StepReport>),
}

/// Runs one step against a batch: precondition, parameters, body, persistence
pub struct StepExecutor {
    services: Services,
}

impl StepExecutor {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn execute(
        &self,
        run_id: RunId,
        step: Arc<StepDefinition>,
        batch: TargetBatch,
        raw: &RawParams,
        pending: &PendingContext,
    ) -> Dispatch {
        let started_at = Utc::now();
        let before = batch.snapshot().await;
        let target_ids = batch.ids();

        tracing::info!(
            run_id = %run_id,
            step = %step.id,
            targets = target_ids.len(),
            "Executing step"
        );

        append(
            &self.services.event_log,
            Event::new(
                run_id,
                EventType::StepStarted {
                    step_id: step.id.clone(),
                    targets: target_ids.clone(),
                },
            ),
        )
        .await;

        if let Some(check) = step.precondition {
            let failures = check(&before);
            if !failures.is_empty() {
                return Dispatch::Finished(
                    self.skip_for_precondition(run_id, &step, &target_ids, failures, started_at)
                        .await,
                );
            }
        }

        let params = match resolve_params(&step, raw, pending, &before) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(step = %step.id, error = %err, "Parameter validation failed");
                let report = abort_report(&step, &target_ids, &err, started_at);
                append(
                    &self.services.event_log,
                    Event::new(
                        run_id,
                        EventType::StepFailed {
                            step_id: step.id.clone(),
                            error: err.to_string(),
                        },
                    ),
                )
                .await;
                return Dispatch::Finished(report);
            }
        };

        let services = self.services.clone();
        if step.is_async() {
            tracing::debug!(step = %step.id, "Handing asynchronous step to worker");
            let handle = tokio::spawn(run_body(
                services, run_id, step, batch, params, before, started_at,
            ));
            Dispatch::Pending(handle)
        } else {
            Dispatch::Finished(
                run_body(services, run_id, step, batch, params, before, started_at).await,
            )
        }
    }

    async fn skip_for_precondition(
        &self,
        run_id: RunId,
        step: &StepDefinition,
        target_ids: &[TargetId],
        failures: BTreeMap<TargetId, String>,
        started_at: chrono::DateTime<Utc>,
    ) -> StepReport {
        let reason = failures
            .iter()
            .map(|(id, message)| format!("{}: {}", id, message))
            .collect::<Vec<_>>()
            .join("; ");

        tracing::warn!(step = %step.id, reason = %reason, "Precondition failed, skipping step for the batch");

        let mut report = StepReport::skipped(step.id.clone(), target_ids, &reason);
        for (id, outcome) in report.targets.iter_mut() {
            *outcome = match failures.get(id) {
                Some(message) => TargetOutcome::skipped(message.clone()),
                None => TargetOutcome::skipped("Precondition failed for another target in the batch"),
            };
        }
        let error = TransitionError::Precondition {
            step: step.id.clone(),
            message: reason.clone(),
        };
        report.error = Some(error.to_string());
        report.error_kind = Some(error.kind());
        report.started_at = Some(started_at);

        append(
            &self.services.event_log,
            Event::new(
                run_id,
                EventType::StepSkipped {
                    step_id: step.id.clone(),
                    reason,
                },
            ),
        )
        .await;

        report
    }
}

/// Validate raw input against each declared parameter
pub fn resolve_params(
    step: &StepDefinition,
    raw: &RawParams,
    pending: &PendingContext,
    targets: &[Target],
) -> Result<StepParams, TransitionError> {
    let mut params = StepParams::new();

    for field in &step.params {
        let invalid = |message: String| TransitionError::InvalidParameter {
            step: step.id.clone(),
            param: field.name.clone(),
            message,
        };

        let supplied = raw
            .get(&field.name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty());

        let Some(choices) = field.choices(pending, targets) else {
            let value = match supplied {
                Some(value) => value.to_string(),
                None => field
                    .default_value(pending, targets)
                    .ok_or_else(|| invalid("a value is required".to_string()))?,
            };
            params.insert(field.name.clone(), ParamValue::Text(value));
            continue;
        };

        let other_offered = choices.iter().any(|c| c.key == OTHER);
        let validate_other = match field.kind {
            FieldKind::ChoiceWithOther { validate } if other_offered => Some(validate),
            _ => None,
        };

        let value = match supplied {
            // A single offered choice is implied
            None if choices.len() == 1 && choices[0].key != OTHER => {
                ParamValue::Choice(choices[0].key.clone())
            }
            None if choices.is_empty() => {
                return Err(invalid("no valid options for this batch".to_string()))
            }
            None => return Err(invalid("a value is required".to_string())),
            Some(OTHER) => {
                let validate = validate_other
                    .ok_or_else(|| invalid("the other option is not available".to_string()))?;
                let literal = raw
                    .get(&format!("{}{}", field.name, OTHER_SUFFIX))
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| invalid("a value for the other option is required".to_string()))?;
                validate(literal).map_err(invalid)?;
                ParamValue::Other(literal.to_string())
            }
            Some(value) if choices.iter().any(|c| c.key == value) => {
                ParamValue::Choice(value.to_string())
            }
            Some(value) => match validate_other {
                Some(validate) => {
                    validate(value).map_err(invalid)?;
                    ParamValue::Other(value.to_string())
                }
                None => {
                    return Err(invalid(format!(
                        "'{}' is not one of the available choices",
                        value
                    )))
                }
            },
        };

        params.insert(field.name.clone(), value);
    }

    Ok(params)
}

/// Invoke the body, audit the changes and persist mutated targets
async fn run_body(
    services: Services,
    run_id: RunId,
    step: Arc<StepDefinition>,
    batch: TargetBatch,
    params: StepParams,
    before: Vec<Target>,
    started_at: chrono::DateTime<Utc>,
) -> StepReport {
    let ctx = StepContext {
        run_id,
        step_id: step.id.clone(),
        services: services.clone(),
    };
    let target_ids = batch.ids();
    let clock = std::time::Instant::now();

    // Bodies work on private copies; only the fields a body changed reach the shared targets
    let working = TargetBatch::new(before.clone());

    let failures = match step.action.run(&ctx, &working, &params).await {
        Ok(failures) => failures,
        Err(err) => {
            let error = if is_integration_disabled(&err) {
                TransitionError::from_collaborator(err)
            } else {
                TransitionError::Other(err)
            };
            tracing::error!(step = %step.id, error = %error, "Step body aborted for the whole batch");
            append(
                &services.event_log,
                Event::new(
                    run_id,
                    EventType::StepFailed {
                        step_id: step.id.clone(),
                        error: error.to_string(),
                    },
                ),
            )
            .await;
            return abort_report(&step, &target_ids, &error, started_at);
        }
    };

    let mut outcomes: BTreeMap<TargetId, TargetOutcome> = BTreeMap::new();
    for ((handle, copy), original) in batch.iter().zip(working.iter()).zip(&before) {
        let id = handle.id().clone();

        if let Some(message) = failures.get(&id) {
            append(
                &services.event_log,
                Event::new(
                    run_id,
                    EventType::TargetFailed {
                        step_id: step.id.clone(),
                        target_id: id.clone(),
                        error: message.clone(),
                    },
                ),
            )
            .await;
            outcomes.insert(id, TargetOutcome::failed(message.clone()));
            continue;
        }

        let worked = copy.snapshot().await;
        let changes = worked.changes_since(original);
        if changes.is_empty() {
            outcomes.insert(id, TargetOutcome::success());
            continue;
        }

        // Held until the merged target is stored so a failed save leaves it untouched
        let mut shared = handle.lock().await;
        let mut merged = shared.clone();
        merged.apply_changes(&worked, &changes);

        if !step.disable_save_object {
            if let Err(err) = services.assets.save(&merged).await {
                tracing::error!(step = %step.id, target = %id, error = %err, "Failed to save target");
                outcomes.insert(id, TargetOutcome::failed(format!("Failed to save target: {:#}", err)));
                continue;
            }
        }
        *shared = merged;
        drop(shared);

        for change in &changes {
            tracing::info!(
                step = %step.id,
                target = %id,
                field = %change.field,
                old = ?change.old,
                new = ?change.new,
                "Target field changed"
            );
            append(
                &services.event_log,
                Event::new(
                    run_id,
                    EventType::TargetChanged {
                        step_id: step.id.clone(),
                        target_id: id.clone(),
                        change: change.clone(),
                    },
                ),
            )
            .await;
        }
        if !step.disable_save_object {
            append(
                &services.event_log,
                Event::new(
                    run_id,
                    EventType::TargetSaved {
                        step_id: step.id.clone(),
                        target_id: id.clone(),
                    },
                ),
            )
            .await;
        }

        outcomes.insert(id, TargetOutcome::success());
    }

    let mut report = StepReport::pending(step.id.clone());
    report.started_at = Some(started_at);
    report.completed_at = Some(Utc::now());
    report.targets = outcomes;

    match report.first_failure() {
        None => {
            report.status = StepStatus::Completed;
            tracing::info!(step = %step.id, "Step completed");
            append(
                &services.event_log,
                Event::new(
                    run_id,
                    EventType::StepCompleted {
                        step_id: step.id.clone(),
                        duration_ms: clock.elapsed().as_millis() as u64,
                    },
                ),
            )
            .await;
        }
        Some((target, message)) => {
            report.status = StepStatus::Failed;
            report.error_kind = Some(ErrorKind::TargetExecution);
            report.error = Some(
                TransitionError::TargetExecution {
                    target,
                    message,
                }
                .to_string(),
            );
            append(
                &services.event_log,
                Event::new(
                    run_id,
                    EventType::StepFailed {
                        step_id: step.id.clone(),
                        error: report.error.clone().unwrap_or_default(),
                    },
                ),
            )
            .await;
        }
    }

    report
}

/// Report for a step that failed for the whole batch before or inside its body
fn abort_report(
    step: &StepDefinition,
    target_ids: &[TargetId],
    error: &TransitionError,
    started_at: chrono::DateTime<Utc>,
) -> StepReport {
    let message = error.to_string();
    let mut report = StepReport::pending(step.id.clone());
    report.status = StepStatus::Failed;
    report.targets = target_ids
        .iter()
        .map(|id| (id.clone(), TargetOutcome::failed(message.clone())))
        .collect();
    report.error = Some(message);
    report.error_kind = Some(error.kind());
    report.started_at = Some(started_at);
    report.completed_at = Some(Utc::now());
    report
}

/// Audit events must not abort a step that already changed state
pub(crate) async fn append(log: &Arc<dyn EventLog>, event: Event) {
    if let Err(err) = log.append(event).await {
        tracing::warn!(error = %err, "Failed to append event to run log");
    }
}
