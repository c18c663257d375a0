use apphub_application::{
    AssetMaterialization, AutoRunFailureState, StalePartitionFlag, WorkflowRunStepAsset,
};
use apphub_core::{AppError, AppResult, RunId, WorkflowId};
use apphub_domain::FreshnessPolicy;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::PostgresWorkflowStore;

impl PostgresWorkflowStore {
    pub(super) async fn record_step_asset_impl(
        &self,
        asset: &WorkflowRunStepAsset,
    ) -> AppResult<()> {
        let freshness = asset
            .freshness
            .map(serde_json::to_value)
            .transpose()
            .map_err(|error| {
                AppError::Internal(format!("failed to serialize asset freshness: {error}"))
            })?;

        sqlx::query(
            r#"
            INSERT INTO workflow_run_step_assets (
                run_id,
                workflow_definition_id,
                step_id,
                asset_id,
                asset_id_normalized,
                partition_key,
                partition_key_normalized,
                produced_at,
                payload,
                schema,
                freshness
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (run_id, step_id, asset_id_normalized, partition_key_normalized)
            DO UPDATE
            SET
                produced_at = EXCLUDED.produced_at,
                payload = EXCLUDED.payload,
                schema = EXCLUDED.schema,
                freshness = EXCLUDED.freshness
            "#,
        )
        .bind(asset.run_id.as_uuid())
        .bind(asset.workflow_definition_id.as_uuid())
        .bind(asset.step_id.as_str())
        .bind(asset.asset_id.as_str())
        .bind(asset.asset_id_normalized.as_str())
        .bind(asset.partition_key.as_deref())
        .bind(asset.partition_key_normalized.as_str())
        .bind(asset.produced_at)
        .bind(&asset.payload)
        .bind(asset.schema.as_ref())
        .bind(freshness.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to record asset '{}' for run '{}': {error}",
                asset.asset_id, asset.run_id
            ))
        })?;

        Ok(())
    }

    pub(super) async fn list_step_assets_impl(
        &self,
        run_id: RunId,
    ) -> AppResult<Vec<WorkflowRunStepAsset>> {
        let rows = sqlx::query_as::<_, StepAssetRow>(
            r#"
            SELECT
                run_id, workflow_definition_id, step_id, asset_id, asset_id_normalized,
                partition_key, partition_key_normalized, produced_at, payload, schema, freshness
            FROM workflow_run_step_assets
            WHERE run_id = $1
            ORDER BY produced_at
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to list assets for run '{run_id}': {error}"))
        })?;

        rows.into_iter().map(StepAssetRow::into_asset).collect()
    }

    pub(super) async fn latest_materializations_impl(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Vec<AssetMaterialization>> {
        let rows = sqlx::query_as::<_, MaterializationRow>(
            r#"
            SELECT DISTINCT ON (a.asset_id_normalized, a.partition_key_normalized)
                a.workflow_definition_id,
                d.slug AS workflow_slug,
                a.run_id,
                a.step_id,
                a.asset_id_normalized AS asset_id,
                a.partition_key,
                a.produced_at
            FROM workflow_run_step_assets a
            INNER JOIN (
                SELECT DISTINCT ON (id) id, slug
                FROM workflow_definitions
                ORDER BY id, version DESC
            ) d ON d.id = a.workflow_definition_id
            WHERE a.workflow_definition_id = $1
            ORDER BY a.asset_id_normalized, a.partition_key_normalized, a.produced_at DESC
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load latest materializations for '{workflow_definition_id}': {error}"
            ))
        })?;

        Ok(rows.into_iter().map(MaterializationRow::into_materialization).collect())
    }

    pub(super) async fn find_latest_materialization_impl(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id_normalized: &str,
        partition_key_normalized: &str,
    ) -> AppResult<Option<AssetMaterialization>> {
        let row = sqlx::query_as::<_, MaterializationRow>(
            r#"
            SELECT
                a.workflow_definition_id,
                d.slug AS workflow_slug,
                a.run_id,
                a.step_id,
                a.asset_id_normalized AS asset_id,
                a.partition_key,
                a.produced_at
            FROM workflow_run_step_assets a
            INNER JOIN (
                SELECT DISTINCT ON (id) id, slug
                FROM workflow_definitions
                ORDER BY id, version DESC
            ) d ON d.id = a.workflow_definition_id
            WHERE a.workflow_definition_id = $1
              AND a.asset_id_normalized = $2
              AND a.partition_key_normalized = $3
            ORDER BY a.produced_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .bind(asset_id_normalized)
        .bind(partition_key_normalized)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load latest materialization of '{asset_id_normalized}': {error}"
            ))
        })?;

        Ok(row.map(MaterializationRow::into_materialization))
    }

    pub(super) async fn mark_partition_stale_impl(
        &self,
        flag: &StalePartitionFlag,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_asset_stale_partitions (
                workflow_definition_id,
                asset_id,
                partition_key,
                requested_at,
                requested_by,
                note
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workflow_definition_id, asset_id, COALESCE(partition_key, ''))
            DO UPDATE
            SET requested_at = EXCLUDED.requested_at,
                requested_by = EXCLUDED.requested_by,
                note = EXCLUDED.note
            "#,
        )
        .bind(flag.workflow_definition_id.as_uuid())
        .bind(flag.asset_id.as_str())
        .bind(flag.partition_key.as_deref())
        .bind(flag.requested_at)
        .bind(flag.requested_by.as_str())
        .bind(flag.note.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to flag asset '{}' stale: {error}",
                flag.asset_id
            ))
        })?;

        Ok(())
    }

    pub(super) async fn clear_partition_stale_impl(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id_normalized: &str,
        partition_key: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM workflow_asset_stale_partitions
            WHERE workflow_definition_id = $1
              AND asset_id = $2
              AND COALESCE(partition_key, '') = COALESCE($3, '')
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .bind(asset_id_normalized)
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to clear stale flag on '{asset_id_normalized}': {error}"
            ))
        })?;

        Ok(())
    }

    pub(super) async fn list_stale_partitions_impl(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Vec<StalePartitionFlag>> {
        let rows = sqlx::query_as::<_, StaleFlagRow>(
            r#"
            SELECT workflow_definition_id, asset_id, partition_key, requested_at, requested_by, note
            FROM workflow_asset_stale_partitions
            WHERE workflow_definition_id = $1
            ORDER BY requested_at DESC
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to list stale partitions for '{workflow_definition_id}': {error}"
            ))
        })?;

        Ok(rows.into_iter().map(StaleFlagRow::into_flag).collect())
    }

    pub(super) async fn find_auto_run_failure_state_impl(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Option<AutoRunFailureState>> {
        let row = sqlx::query_as::<_, FailureStateRow>(
            r#"
            SELECT workflow_definition_id, failures, next_eligible_at
            FROM workflow_asset_failure_state
            WHERE workflow_definition_id = $1
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load auto-run failure state for '{workflow_definition_id}': {error}"
            ))
        })?;

        Ok(row.map(FailureStateRow::into_state))
    }

    pub(super) async fn record_auto_run_failure_impl(
        &self,
        state: AutoRunFailureState,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_asset_failure_state (workflow_definition_id, failures, next_eligible_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_definition_id) DO UPDATE
            SET failures = EXCLUDED.failures, next_eligible_at = EXCLUDED.next_eligible_at
            "#,
        )
        .bind(state.workflow_definition_id.as_uuid())
        .bind(state.failures)
        .bind(state.next_eligible_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to record auto-run failure for '{}': {error}",
                state.workflow_definition_id
            ))
        })?;

        Ok(())
    }

    pub(super) async fn clear_auto_run_failure_impl(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM workflow_asset_failure_state
            WHERE workflow_definition_id = $1
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to clear auto-run failure state for '{workflow_definition_id}': {error}"
            ))
        })?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StepAssetRow {
    run_id: Uuid,
    workflow_definition_id: Uuid,
    step_id: String,
    asset_id: String,
    asset_id_normalized: String,
    partition_key: Option<String>,
    partition_key_normalized: String,
    produced_at: DateTime<Utc>,
    payload: Value,
    schema: Option<Value>,
    freshness: Option<Value>,
}

impl StepAssetRow {
    fn into_asset(self) -> AppResult<WorkflowRunStepAsset> {
        let freshness = self
            .freshness
            .map(serde_json::from_value::<FreshnessPolicy>)
            .transpose()
            .map_err(|error| {
                AppError::Internal(format!("failed to decode stored asset freshness: {error}"))
            })?;

        Ok(WorkflowRunStepAsset {
            run_id: RunId::from_uuid(self.run_id),
            workflow_definition_id: WorkflowId::from_uuid(self.workflow_definition_id),
            step_id: self.step_id,
            asset_id: self.asset_id,
            asset_id_normalized: self.asset_id_normalized,
            partition_key: self.partition_key,
            partition_key_normalized: self.partition_key_normalized,
            produced_at: self.produced_at,
            payload: self.payload,
            schema: self.schema,
            freshness,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MaterializationRow {
    workflow_definition_id: Uuid,
    workflow_slug: String,
    run_id: Uuid,
    step_id: String,
    asset_id: String,
    partition_key: Option<String>,
    produced_at: DateTime<Utc>,
}

impl MaterializationRow {
    fn into_materialization(self) -> AssetMaterialization {
        AssetMaterialization {
            workflow_definition_id: WorkflowId::from_uuid(self.workflow_definition_id),
            workflow_slug: self.workflow_slug,
            run_id: RunId::from_uuid(self.run_id),
            step_id: self.step_id,
            asset_id: self.asset_id,
            partition_key: self.partition_key,
            produced_at: self.produced_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StaleFlagRow {
    workflow_definition_id: Uuid,
    asset_id: String,
    partition_key: Option<String>,
    requested_at: DateTime<Utc>,
    requested_by: String,
    note: Option<String>,
}

impl StaleFlagRow {
    fn into_flag(self) -> StalePartitionFlag {
        StalePartitionFlag {
            workflow_definition_id: WorkflowId::from_uuid(self.workflow_definition_id),
            asset_id: self.asset_id,
            partition_key: self.partition_key,
            requested_at: self.requested_at,
            requested_by: self.requested_by,
            note: self.note,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FailureStateRow {
    workflow_definition_id: Uuid,
    failures: i32,
    next_eligible_at: Option<DateTime<Utc>>,
}

impl FailureStateRow {
    fn into_state(self) -> AutoRunFailureState {
        AutoRunFailureState {
            workflow_definition_id: WorkflowId::from_uuid(self.workflow_definition_id),
            failures: self.failures,
            next_eligible_at: self.next_eligible_at,
        }
    }
}
