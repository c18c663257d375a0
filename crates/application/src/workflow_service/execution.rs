use std::collections::HashMap;

use apphub_core::run_key::scheduled_job_id;
use apphub_core::{AppResult, RunId, truncate_error_message};
use apphub_domain::{WorkflowDefinition, WorkflowStep};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::audit_ports::{AuditAction, AuditEvent};
use crate::event_bus::CoreEvent;
use crate::queue_ports::{JOB_WORKFLOW_RETRY, QueueJob, QueueKey};
use crate::workflow_ports::{
    CompleteWorkflowRunInput, WorkflowRun, WorkflowRunStatus, WorkflowStepRun, WorkflowStepStatus,
};

use super::WorkflowService;
use super::steps::StepAttemptOutcome;

/// Builds the deterministic job identifier for one scheduled step retry.
pub(super) fn workflow_retry_job_id(run: &WorkflowRun, step_id: &str, attempt: i32) -> String {
    let key_segment = run
        .run_key
        .clone()
        .unwrap_or_else(|| run.id.to_string());

    scheduled_job_id([
        JOB_WORKFLOW_RETRY,
        key_segment.as_str(),
        run.id.to_string().as_str(),
        format!("{step_id}-{attempt}").as_str(),
    ])
}

/// How one `execute_run` invocation left the run.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The run reached a terminal status.
    Finished(WorkflowRun),
    /// Steps are parked behind scheduled retries; a delayed job resumes the
    /// run later.
    Suspended {
        /// The run as persisted, still running.
        run: WorkflowRun,
        /// Earliest scheduled resume time.
        next_attempt_at: DateTime<Utc>,
    },
}

struct RunState {
    shared: Value,
    steps_scope: Value,
    step_runs: HashMap<String, WorkflowStepRun>,
    first_error: Option<(String, String)>,
    fatal: bool,
}

impl RunState {
    fn from_persisted(run: &WorkflowRun, persisted: Vec<WorkflowStepRun>) -> Self {
        let mut steps_scope = Map::new();
        let mut step_runs = HashMap::new();
        let mut first_error = None;
        let mut fatal = false;

        for step in persisted {
            if step.parent_step_id.is_some() {
                continue;
            }

            steps_scope.insert(
                step.step_id.clone(),
                json!({
                    "status": step.status.as_str(),
                    "result": step.result.clone().unwrap_or(Value::Null),
                }),
            );

            if step.status == WorkflowStepStatus::Failed {
                fatal = true;
                if first_error.is_none() {
                    first_error = Some((
                        step.error_message.clone().unwrap_or_else(|| "step failed".to_owned()),
                        step.step_id.clone(),
                    ));
                }
            }

            step_runs.insert(step.step_id.clone(), step);
        }

        Self {
            shared: run.shared.clone(),
            steps_scope: Value::Object(steps_scope),
            step_runs,
            first_error,
            fatal,
        }
    }

    fn status_of(&self, step_id: &str) -> Option<WorkflowStepStatus> {
        self.step_runs.get(step_id).map(|step| step.status)
    }

    fn dependencies_satisfied(&self, step: &WorkflowStep) -> bool {
        step.depends_on.iter().all(|dependency| {
            self.status_of(dependency.as_str())
                .is_some_and(|status| status.satisfies_dependency())
        })
    }

    fn record(&mut self, step_run: WorkflowStepRun) {
        if let Value::Object(scope) = &mut self.steps_scope {
            scope.insert(
                step_run.step_id.clone(),
                json!({
                    "status": step_run.status.as_str(),
                    "result": step_run.result.clone().unwrap_or(Value::Null),
                }),
            );
        }

        if step_run.status == WorkflowStepStatus::Failed {
            self.fatal = true;
            if self.first_error.is_none() {
                self.first_error = Some((
                    step_run
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "step failed".to_owned()),
                    step_run.step_id.clone(),
                ));
            }
        }

        self.step_runs.insert(step_run.step_id.clone(), step_run);
    }
}

impl WorkflowService {
    /// Executes one run as far as currently possible.
    ///
    /// The fixed-point loop launches every eligible step, bounded by the
    /// per-run parallel cap; steps parked behind a scheduled retry suspend
    /// the run until the delayed retry job resumes it. Terminal runs return
    /// unchanged, which makes redelivered queue jobs harmless.
    pub async fn execute_run(&self, run_id: RunId) -> AppResult<ExecutionOutcome> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(ExecutionOutcome::Finished(run));
        }

        let definition = self.get_definition_by_id(run.workflow_definition_id).await?;
        self.store.mark_run_running(run_id, self.clock.now()).await?;

        let persisted = self.store.list_step_runs(run_id).await?;
        let mut state = RunState::from_persisted(&run, persisted);

        loop {
            // Cancellation requested between batches stops dispatch.
            let current = self.get_run(run_id).await?;
            if current.status == WorkflowRunStatus::Canceled {
                return Ok(ExecutionOutcome::Finished(current));
            }

            let now = self.clock.now();
            let eligible: Vec<&WorkflowStep> = if state.fatal {
                Vec::new()
            } else {
                definition
                    .steps()
                    .iter()
                    .filter(|step| {
                        let launchable = match state.step_runs.get(step.id.as_str()) {
                            None => true,
                            Some(existing) => {
                                existing.status == WorkflowStepStatus::Pending
                                    && existing.next_attempt_at.is_none_or(|at| at <= now)
                            }
                        };
                        launchable && state.dependencies_satisfied(step)
                    })
                    .take(self.max_parallel_steps)
                    .collect()
            };

            if eligible.is_empty() {
                let waiting_retry = definition
                    .steps()
                    .iter()
                    .filter_map(|step| state.step_runs.get(step.id.as_str()))
                    .filter_map(|step| {
                        (step.status == WorkflowStepStatus::Pending)
                            .then_some(step.next_attempt_at)
                            .flatten()
                    })
                    .min();

                if !state.fatal && let Some(next_attempt_at) = waiting_retry {
                    self.store.update_run_shared(run_id, &state.shared).await?;
                    let run = self.get_run(run_id).await?;
                    return Ok(ExecutionOutcome::Suspended {
                        run,
                        next_attempt_at,
                    });
                }

                return self.finalize_run(&definition, run_id, state).await.map(ExecutionOutcome::Finished);
            }

            let mut attempts = JoinSet::new();
            for step in eligible {
                let attempt = state
                    .step_runs
                    .get(step.id.as_str())
                    .map_or(1, |existing| existing.attempt + 1);

                let started = WorkflowStepRun {
                    step_id: step.id.clone(),
                    parent_step_id: None,
                    status: WorkflowStepStatus::Running,
                    attempt,
                    job_run_id: None,
                    result: None,
                    error_message: None,
                    error_kind: None,
                    next_attempt_at: None,
                    started_at: Some(
                        state
                            .step_runs
                            .get(step.id.as_str())
                            .and_then(|existing| existing.started_at)
                            .unwrap_or(now),
                    ),
                    completed_at: None,
                };
                self.store.upsert_step_run(run_id, &started).await?;
                state.record(started.clone());

                let service = self.clone();
                let step = step.clone();
                let run = run.clone();
                let shared = state.shared.clone();
                let steps_scope = state.steps_scope.clone();
                attempts.spawn(async move {
                    let outcome = service
                        .execute_step_attempt(&step, &run, &shared, &steps_scope)
                        .await;
                    (step, attempt, outcome)
                });
            }

            while let Some(joined) = attempts.join_next().await {
                let (step, attempt, outcome) = match joined {
                    Ok(result) => result,
                    Err(error) => {
                        warn!(run_id = %run_id, error = %error, "step attempt task join failed");
                        continue;
                    }
                };

                self.apply_step_outcome(&definition, &run, &mut state, &step, attempt, outcome)
                    .await?;
            }
        }
    }

    async fn apply_step_outcome(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        state: &mut RunState,
        step: &WorkflowStep,
        attempt: i32,
        outcome: StepAttemptOutcome,
    ) -> AppResult<()> {
        let now = self.clock.now();
        let started_at = state
            .step_runs
            .get(step.id.as_str())
            .and_then(|existing| existing.started_at);

        match outcome {
            StepAttemptOutcome::Succeeded {
                result,
                job_run_id,
                child_runs,
            } => {
                for child in &child_runs {
                    self.store.upsert_step_run(run.id, child).await?;
                }

                // Ordering: persist the step result, record assets, persist
                // the shared scope, then publish asset.produced.
                let step_run = WorkflowStepRun {
                    step_id: step.id.clone(),
                    parent_step_id: None,
                    status: WorkflowStepStatus::Succeeded,
                    attempt,
                    job_run_id,
                    result: Some(result.clone()),
                    error_message: None,
                    error_kind: None,
                    next_attempt_at: None,
                    started_at,
                    completed_at: Some(now),
                };

                self.store.upsert_step_run(run.id, &step_run).await?;

                let recorded = match self.persist_step_assets(definition, step, run, &result, now).await {
                    Ok(notices) => {
                        state.record(step_run);
                        notices
                    }
                    Err(error) => {
                        // Asset bookkeeping failures fail the step terminally.
                        let failed = WorkflowStepRun {
                            status: WorkflowStepStatus::Failed,
                            result: Some(result.clone()),
                            error_message: Some(truncate_error_message(error.to_string().as_str())),
                            error_kind: Some(error.kind().to_owned()),
                            completed_at: Some(now),
                            ..step_run
                        };
                        self.store.upsert_step_run(run.id, &failed).await?;
                        state.record(failed);
                        return Ok(());
                    }
                };

                self.store_step_value(state, step, &result);
                self.store.update_run_shared(run.id, &state.shared).await?;

                for notice in recorded {
                    self.bus.publish(CoreEvent::AssetProduced(notice)).await?;
                }

                if attempt > 1 {
                    // A replaced retry job may still sit in the queue.
                    let retry_job_id = workflow_retry_job_id(run, step.id.as_str(), attempt - 1);
                    self.queue
                        .remove_job(QueueKey::Workflow, retry_job_id.as_str())
                        .await?;
                }
            }
            StepAttemptOutcome::Failed {
                message,
                kind,
                retryable,
                child_runs,
            } => {
                for child in &child_runs {
                    self.store.upsert_step_run(run.id, child).await?;
                }

                let policy = step.retry_policy;
                let allows_retry = retryable
                    && policy.is_some_and(|policy| {
                        policy.allows_retry(u32::try_from(attempt).unwrap_or(u32::MAX))
                    });

                if allows_retry {
                    let Some(policy) = policy else {
                        return Ok(());
                    };

                    let delay_ms = policy.delay_ms_for_attempt(
                        u32::try_from(attempt).unwrap_or(1),
                        &mut rand::thread_rng(),
                    );
                    let next_attempt_at =
                        now + Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX));

                    let step_run = WorkflowStepRun {
                        step_id: step.id.clone(),
                        parent_step_id: None,
                        status: WorkflowStepStatus::Pending,
                        attempt,
                        job_run_id: None,
                        result: None,
                        error_message: Some(truncate_error_message(message.as_str())),
                        error_kind: Some(kind.clone()),
                        next_attempt_at: Some(next_attempt_at),
                        started_at,
                        completed_at: None,
                    };
                    self.store.upsert_step_run(run.id, &step_run).await?;
                    state.record(step_run);

                    let job_id = workflow_retry_job_id(run, step.id.as_str(), attempt);
                    self.queue
                        .enqueue(
                            QueueKey::Workflow,
                            QueueJob::delayed(
                                JOB_WORKFLOW_RETRY,
                                Some(job_id),
                                json!({"runId": run.id.to_string(), "stepId": step.id}),
                                next_attempt_at,
                            ),
                        )
                        .await?;

                    info!(
                        run_id = %run.id,
                        step_id = %step.id,
                        attempt,
                        delay_ms,
                        error_kind = %kind,
                        "step attempt failed; retry scheduled"
                    );
                } else {
                    let step_run = WorkflowStepRun {
                        step_id: step.id.clone(),
                        parent_step_id: None,
                        status: WorkflowStepStatus::Failed,
                        attempt,
                        job_run_id: None,
                        result: None,
                        error_message: Some(truncate_error_message(message.as_str())),
                        error_kind: Some(kind),
                        next_attempt_at: None,
                        started_at,
                        completed_at: Some(now),
                    };
                    self.store.upsert_step_run(run.id, &step_run).await?;
                    state.record(step_run);
                }
            }
        }

        Ok(())
    }

    async fn finalize_run(
        &self,
        definition: &WorkflowDefinition,
        run_id: RunId,
        state: RunState,
    ) -> AppResult<WorkflowRun> {
        let now = self.clock.now();

        let all_satisfied = definition.steps().iter().all(|step| {
            state
                .status_of(step.id.as_str())
                .is_some_and(|status| status.satisfies_dependency())
        });

        let (status, error_message) = if all_satisfied {
            (WorkflowRunStatus::Succeeded, None)
        } else {
            let message = state
                .first_error
                .as_ref()
                .map(|(message, step_id)| format!("step '{step_id}': {message}"))
                .unwrap_or_else(|| "workflow failed".to_owned());
            (WorkflowRunStatus::Failed, Some(truncate_error_message(message.as_str())))
        };

        let completed = self
            .store
            .complete_run(CompleteWorkflowRunInput {
                run_id,
                status,
                error_message,
                shared: state.shared,
                completed_at: now,
            })
            .await?;

        self.bus
            .publish(CoreEvent::WorkflowRunCompleted {
                run_id,
                workflow_definition_id: completed.workflow_definition_id,
                status: completed.status,
                trigger_type: completed.trigger.trigger_type.clone(),
            })
            .await?;

        self.audit
            .append_event(AuditEvent {
                actor: "workflow-orchestrator".to_owned(),
                action: AuditAction::WorkflowRunCompleted,
                resource_type: "workflow_run".to_owned(),
                resource_id: run_id.to_string(),
                detail: Some(format!(
                    "workflow '{}' finished with status '{}'",
                    definition.slug(),
                    completed.status.as_str()
                )),
            })
            .await?;

        Ok(completed)
    }

    fn store_step_value(&self, state: &mut RunState, step: &WorkflowStep, result: &Value) {
        use apphub_domain::WorkflowStepKind;

        let slot = match &step.kind {
            WorkflowStepKind::Job { store_result_as, .. } => {
                store_result_as.as_ref().map(|key| (key.clone(), result.clone()))
            }
            WorkflowStepKind::Service { store_response_as, .. } => store_response_as
                .as_ref()
                .map(|key| (key.clone(), result.get("body").cloned().unwrap_or(Value::Null))),
            WorkflowStepKind::FanOut { store_results_as, .. } => store_results_as
                .as_ref()
                .map(|key| (key.clone(), result.get("items").cloned().unwrap_or(Value::Null))),
        };

        if let Some((key, value)) = slot {
            if !state.shared.is_object() {
                state.shared = Value::Object(Map::new());
            }

            if let Value::Object(shared) = &mut state.shared {
                shared.insert(key, value);
            }
        }
    }
}
