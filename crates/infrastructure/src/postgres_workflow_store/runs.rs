use apphub_application::{
    CompleteWorkflowRunInput, CreateRunOutcome, CreateWorkflowRunInput, WorkflowRun,
    WorkflowRunListQuery, WorkflowRunStatus, WorkflowRunTrigger,
};
use apphub_core::run_key::normalize_run_key;
use apphub_core::{AppError, AppResult, RunId, WorkflowId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::PostgresWorkflowStore;

impl PostgresWorkflowStore {
    pub(super) async fn create_run_impl(
        &self,
        input: CreateWorkflowRunInput,
    ) -> AppResult<CreateRunOutcome> {
        let run_key_normalized = input
            .run_key
            .as_deref()
            .map(normalize_run_key)
            .filter(|normalized| !normalized.is_empty());

        let trigger = serde_json::to_value(&input.trigger).map_err(|error| {
            AppError::Internal(format!("failed to serialize run trigger: {error}"))
        })?;

        let run_id = RunId::new();
        let inserted = sqlx::query_as::<_, RunRow>(
            r#"
            INSERT INTO workflow_runs (
                id,
                workflow_definition_id,
                status,
                run_key,
                run_key_normalized,
                parameters,
                trigger,
                triggered_by,
                partition_key,
                created_at,
                shared
            )
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, now(), '{}'::jsonb)
            ON CONFLICT (workflow_definition_id, run_key_normalized)
                WHERE status IN ('pending', 'running')
            DO NOTHING
            RETURNING
                id, workflow_definition_id, status, run_key, run_key_normalized, parameters,
                trigger, triggered_by, partition_key, created_at, started_at, completed_at,
                error_message, shared
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(input.workflow_definition_id.as_uuid())
        .bind(input.run_key.as_deref())
        .bind(run_key_normalized.as_deref())
        .bind(&input.parameters)
        .bind(&trigger)
        .bind(input.triggered_by.as_deref())
        .bind(input.partition_key.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to create workflow run for '{}': {error}",
                input.workflow_definition_id
            ))
        })?;

        if let Some(row) = inserted {
            return Ok(CreateRunOutcome::Created(row.into_run()?));
        }

        // The partial unique index refused the insert: surface the active
        // holder of the key.
        let Some(normalized) = run_key_normalized else {
            return Err(AppError::Internal(
                "workflow run insert returned no row without a run key".to_owned(),
            ));
        };

        let existing = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT
                id, workflow_definition_id, status, run_key, run_key_normalized, parameters,
                trigger, triggered_by, partition_key, created_at, started_at, completed_at,
                error_message, shared
            FROM workflow_runs
            WHERE workflow_definition_id = $1
              AND run_key_normalized = $2
              AND status IN ('pending', 'running')
            LIMIT 1
            "#,
        )
        .bind(input.workflow_definition_id.as_uuid())
        .bind(normalized.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load conflicting workflow run: {error}"))
        })?;

        match existing {
            Some(row) => Ok(CreateRunOutcome::Existing(row.into_run()?)),
            // The holder finished between insert and select; retry once.
            None => Box::pin(self.create_run_impl(input)).await,
        }
    }

    pub(super) async fn find_run_impl(&self, run_id: RunId) -> AppResult<Option<WorkflowRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT
                id, workflow_definition_id, status, run_key, run_key_normalized, parameters,
                trigger, triggered_by, partition_key, created_at, started_at, completed_at,
                error_message, shared
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load workflow run '{run_id}': {error}"))
        })?;

        row.map(RunRow::into_run).transpose()
    }

    pub(super) async fn list_runs_impl(
        &self,
        query: WorkflowRunListQuery,
    ) -> AppResult<Vec<WorkflowRun>> {
        let limit = i64::try_from(query.limit.min(500)).unwrap_or(100);
        let offset = i64::try_from(query.offset).unwrap_or(0);

        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT
                id, workflow_definition_id, status, run_key, run_key_normalized, parameters,
                trigger, triggered_by, partition_key, created_at, started_at, completed_at,
                error_message, shared
            FROM workflow_runs
            WHERE ($1::uuid IS NULL OR workflow_definition_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(query.workflow_definition_id.map(|id| id.as_uuid()))
        .bind(query.status.map(|status| status.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to list workflow runs: {error}")))?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    pub(super) async fn mark_run_running_impl(
        &self,
        run_id: RunId,
        started_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'running', started_at = COALESCE(started_at, $2)
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to mark workflow run '{run_id}' running: {error}"))
        })?;

        Ok(())
    }

    pub(super) async fn update_run_shared_impl(
        &self,
        run_id: RunId,
        shared: &Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET shared = $2
            WHERE id = $1
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(shared)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to persist shared scope for run '{run_id}': {error}"
            ))
        })?;

        Ok(())
    }

    pub(super) async fn complete_run_impl(
        &self,
        input: CompleteWorkflowRunInput,
    ) -> AppResult<WorkflowRun> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE workflow_runs
            SET
                status = $2,
                error_message = $3,
                shared = $4,
                completed_at = $5
            WHERE id = $1
            RETURNING
                id, workflow_definition_id, status, run_key, run_key_normalized, parameters,
                trigger, triggered_by, partition_key, created_at, started_at, completed_at,
                error_message, shared
            "#,
        )
        .bind(input.run_id.as_uuid())
        .bind(input.status.as_str())
        .bind(input.error_message.as_deref())
        .bind(&input.shared)
        .bind(input.completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to complete workflow run '{}': {error}",
                input.run_id
            ))
        })?;

        let Some(row) = row else {
            return Err(AppError::NotFound(format!(
                "workflow run '{}' not found",
                input.run_id
            )));
        };

        row.into_run()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    workflow_definition_id: Uuid,
    status: String,
    run_key: Option<String>,
    run_key_normalized: Option<String>,
    parameters: Value,
    trigger: Value,
    triggered_by: Option<String>,
    partition_key: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    shared: Value,
}

impl RunRow {
    fn into_run(self) -> AppResult<WorkflowRun> {
        let trigger: WorkflowRunTrigger = serde_json::from_value(self.trigger).map_err(|error| {
            AppError::Internal(format!("failed to decode stored run trigger: {error}"))
        })?;

        Ok(WorkflowRun {
            id: RunId::from_uuid(self.id),
            workflow_definition_id: WorkflowId::from_uuid(self.workflow_definition_id),
            status: WorkflowRunStatus::parse(self.status.as_str())?,
            run_key: self.run_key,
            run_key_normalized: self.run_key_normalized,
            parameters: self.parameters,
            trigger,
            triggered_by: self.triggered_by,
            partition_key: self.partition_key,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            shared: self.shared,
        })
    }
}
