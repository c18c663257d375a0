use apphub_application::{WorkflowStepRun, WorkflowStepStatus};
use apphub_core::{AppError, AppResult, RunId};
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::PostgresWorkflowStore;

impl PostgresWorkflowStore {
    pub(super) async fn upsert_step_run_impl(
        &self,
        run_id: RunId,
        step: &WorkflowStepRun,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_step_runs (
                run_id,
                step_id,
                parent_step_id,
                status,
                attempt,
                job_run_id,
                result,
                error_message,
                error_kind,
                next_attempt_at,
                started_at,
                completed_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
            ON CONFLICT (run_id, step_id) DO UPDATE
            SET
                status = EXCLUDED.status,
                attempt = EXCLUDED.attempt,
                job_run_id = EXCLUDED.job_run_id,
                result = EXCLUDED.result,
                error_message = EXCLUDED.error_message,
                error_kind = EXCLUDED.error_kind,
                next_attempt_at = EXCLUDED.next_attempt_at,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                updated_at = now()
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(step.step_id.as_str())
        .bind(step.parent_step_id.as_deref())
        .bind(step.status.as_str())
        .bind(step.attempt)
        .bind(step.job_run_id.as_deref())
        .bind(step.result.as_ref())
        .bind(step.error_message.as_deref())
        .bind(step.error_kind.as_deref())
        .bind(step.next_attempt_at)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to upsert step run '{}' for run '{run_id}': {error}",
                step.step_id
            ))
        })?;

        Ok(())
    }

    pub(super) async fn list_step_runs_impl(
        &self,
        run_id: RunId,
    ) -> AppResult<Vec<WorkflowStepRun>> {
        let rows = sqlx::query_as::<_, StepRunRow>(
            r#"
            SELECT
                step_id, parent_step_id, status, attempt, job_run_id, result, error_message,
                error_kind, next_attempt_at, started_at, completed_at
            FROM workflow_step_runs
            WHERE run_id = $1
            ORDER BY started_at NULLS LAST, step_id
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to list step runs for '{run_id}': {error}"))
        })?;

        rows.into_iter().map(StepRunRow::into_step_run).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StepRunRow {
    step_id: String,
    parent_step_id: Option<String>,
    status: String,
    attempt: i32,
    job_run_id: Option<String>,
    result: Option<Value>,
    error_message: Option<String>,
    error_kind: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl StepRunRow {
    fn into_step_run(self) -> AppResult<WorkflowStepRun> {
        Ok(WorkflowStepRun {
            step_id: self.step_id,
            parent_step_id: self.parent_step_id,
            status: WorkflowStepStatus::parse(self.status.as_str())?,
            attempt: self.attempt,
            job_run_id: self.job_run_id,
            result: self.result,
            error_message: self.error_message,
            error_kind: self.error_kind,
            next_attempt_at: self.next_attempt_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
