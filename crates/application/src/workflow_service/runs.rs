use apphub_core::run_key::scheduled_job_id;
use apphub_core::{AppError, AppResult, RunId, truncate_error_message};
use apphub_domain::merge_parameter_layers;
use serde_json::json;
use tracing::info;

use crate::audit_ports::{AuditAction, AuditEvent};
use crate::event_bus::CoreEvent;
use crate::queue_ports::{EnqueueDisposition, JOB_WORKFLOW_RUN, QueueJob, QueueKey};
use crate::workflow_ports::{
    CompleteWorkflowRunInput, CreateRunOutcome, CreateWorkflowRunInput, WorkflowRun,
    WorkflowRunListQuery, WorkflowRunStatus, WorkflowRunStepAsset, WorkflowStepRun,
    WorkflowStepStatus,
};

use super::WorkflowService;

impl WorkflowService {
    /// Creates one run under the run-key uniqueness guarantee.
    ///
    /// On a run-key conflict the existing active run is returned; callers may
    /// re-enqueue it idempotently.
    pub async fn create_run(&self, input: CreateWorkflowRunInput) -> AppResult<CreateRunOutcome> {
        let definition = self.get_definition_by_id(input.workflow_definition_id).await?;

        let parameters =
            merge_parameter_layers(&[definition.default_parameters(), &input.parameters]);

        self.store
            .create_run(CreateWorkflowRunInput {
                parameters,
                ..input
            })
            .await
    }

    /// Creates one run and enqueues it for execution.
    ///
    /// Run-key conflicts re-enqueue the existing run; the duplicate job id
    /// makes that a no-op when the job is already queued.
    pub async fn create_and_enqueue_run(
        &self,
        input: CreateWorkflowRunInput,
    ) -> AppResult<CreateRunOutcome> {
        let outcome = self.create_run(input).await?;

        if !outcome.is_created() {
            info!(
                run_id = %outcome.run().id,
                run_key = outcome.run().run_key.as_deref().unwrap_or_default(),
                "run key held by an active run; re-enqueueing the existing run"
            );
        }

        self.enqueue_run(outcome.run()).await?;
        Ok(outcome)
    }

    /// Enqueues one run for worker execution.
    pub async fn enqueue_run(&self, run: &WorkflowRun) -> AppResult<EnqueueDisposition> {
        self.queue
            .enqueue(
                QueueKey::Workflow,
                QueueJob::immediate(
                    JOB_WORKFLOW_RUN,
                    Some(scheduled_job_id([JOB_WORKFLOW_RUN, run.id.to_string().as_str()])),
                    json!({"runId": run.id.to_string()}),
                ),
            )
            .await
    }

    /// Returns one run.
    pub async fn get_run(&self, run_id: RunId) -> AppResult<WorkflowRun> {
        self.store
            .find_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workflow run '{run_id}' not found")))
    }

    /// Lists runs matching a query.
    pub async fn list_runs(&self, query: WorkflowRunListQuery) -> AppResult<Vec<WorkflowRun>> {
        self.store.list_runs(query).await
    }

    /// Lists step runs for one run.
    pub async fn list_step_runs(&self, run_id: RunId) -> AppResult<Vec<WorkflowStepRun>> {
        self.store.list_step_runs(run_id).await
    }

    /// Lists assets produced by one run.
    pub async fn list_run_assets(&self, run_id: RunId) -> AppResult<Vec<WorkflowRunStepAsset>> {
        self.store.list_step_assets(run_id).await
    }

    /// Cancels one run.
    ///
    /// In-flight steps are marked failed with a `canceled` tag, pending step
    /// retry jobs are removed, and no further steps are dispatched.
    pub async fn cancel_run(&self, actor: &str, run_id: RunId) -> AppResult<WorkflowRun> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let now = self.clock.now();
        let step_runs = self.store.list_step_runs(run_id).await?;
        for step in step_runs {
            match step.status {
                WorkflowStepStatus::Running => {
                    self.store
                        .upsert_step_run(
                            run_id,
                            &WorkflowStepRun {
                                status: WorkflowStepStatus::Failed,
                                error_message: Some("canceled".to_owned()),
                                error_kind: Some("canceled".to_owned()),
                                completed_at: Some(now),
                                ..step
                            },
                        )
                        .await?;
                }
                WorkflowStepStatus::Pending if step.next_attempt_at.is_some() => {
                    let retry_job_id = super::execution::workflow_retry_job_id(
                        &run,
                        step.step_id.as_str(),
                        step.attempt,
                    );
                    self.queue
                        .remove_job(QueueKey::Workflow, retry_job_id.as_str())
                        .await?;
                }
                _ => {}
            }
        }

        let completed = self
            .store
            .complete_run(CompleteWorkflowRunInput {
                run_id,
                status: WorkflowRunStatus::Canceled,
                error_message: Some(truncate_error_message("canceled by request")),
                shared: run.shared.clone(),
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
                actor: actor.to_owned(),
                action: AuditAction::WorkflowRunCompleted,
                resource_type: "workflow_run".to_owned(),
                resource_id: run_id.to_string(),
                detail: Some("canceled".to_owned()),
            })
            .await?;

        Ok(completed)
    }
}
