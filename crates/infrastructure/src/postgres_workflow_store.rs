//! PostgreSQL-backed workflow store.
//!
//! The partial unique index on
//! `(workflow_definition_id, run_key_normalized) WHERE status IN
//! ('pending','running')` carries the run-key guarantee; `create_run` inserts
//! through it and surfaces the existing active run on conflict.

use sqlx::PgPool;

mod assets;
mod definitions;
mod runs;
mod steps;

use async_trait::async_trait;
use apphub_application::{
    AssetMaterialization, AutoRunFailureState, CompleteWorkflowRunInput, CreateRunOutcome,
    CreateWorkflowRunInput, StalePartitionFlag, WorkflowRun, WorkflowRunListQuery,
    WorkflowRunStepAsset, WorkflowStepRun, WorkflowStore,
};
use apphub_core::{AppResult, RunId, WorkflowId};
use apphub_domain::WorkflowDefinition;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// PostgreSQL implementation of the workflow store port.
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn insert_definition(&self, definition: &WorkflowDefinition) -> AppResult<()> {
        self.insert_definition_impl(definition).await
    }

    async fn find_definition(&self, id: WorkflowId) -> AppResult<Option<WorkflowDefinition>> {
        self.find_definition_impl(id).await
    }

    async fn find_definition_by_slug(&self, slug: &str) -> AppResult<Option<WorkflowDefinition>> {
        self.find_definition_by_slug_impl(slug).await
    }

    async fn list_definitions(&self) -> AppResult<Vec<WorkflowDefinition>> {
        self.list_definitions_impl().await
    }

    async fn create_run(&self, input: CreateWorkflowRunInput) -> AppResult<CreateRunOutcome> {
        self.create_run_impl(input).await
    }

    async fn find_run(&self, run_id: RunId) -> AppResult<Option<WorkflowRun>> {
        self.find_run_impl(run_id).await
    }

    async fn list_runs(&self, query: WorkflowRunListQuery) -> AppResult<Vec<WorkflowRun>> {
        self.list_runs_impl(query).await
    }

    async fn mark_run_running(&self, run_id: RunId, started_at: DateTime<Utc>) -> AppResult<()> {
        self.mark_run_running_impl(run_id, started_at).await
    }

    async fn update_run_shared(&self, run_id: RunId, shared: &Value) -> AppResult<()> {
        self.update_run_shared_impl(run_id, shared).await
    }

    async fn complete_run(&self, input: CompleteWorkflowRunInput) -> AppResult<WorkflowRun> {
        self.complete_run_impl(input).await
    }

    async fn upsert_step_run(&self, run_id: RunId, step: &WorkflowStepRun) -> AppResult<()> {
        self.upsert_step_run_impl(run_id, step).await
    }

    async fn list_step_runs(&self, run_id: RunId) -> AppResult<Vec<WorkflowStepRun>> {
        self.list_step_runs_impl(run_id).await
    }

    async fn record_step_asset(&self, asset: &WorkflowRunStepAsset) -> AppResult<()> {
        self.record_step_asset_impl(asset).await
    }

    async fn list_step_assets(&self, run_id: RunId) -> AppResult<Vec<WorkflowRunStepAsset>> {
        self.list_step_assets_impl(run_id).await
    }

    async fn latest_materializations(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Vec<AssetMaterialization>> {
        self.latest_materializations_impl(workflow_definition_id).await
    }

    async fn find_latest_materialization(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id_normalized: &str,
        partition_key_normalized: &str,
    ) -> AppResult<Option<AssetMaterialization>> {
        self.find_latest_materialization_impl(
            workflow_definition_id,
            asset_id_normalized,
            partition_key_normalized,
        )
        .await
    }

    async fn mark_partition_stale(&self, flag: &StalePartitionFlag) -> AppResult<()> {
        self.mark_partition_stale_impl(flag).await
    }

    async fn clear_partition_stale(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id_normalized: &str,
        partition_key: Option<&str>,
    ) -> AppResult<()> {
        self.clear_partition_stale_impl(workflow_definition_id, asset_id_normalized, partition_key)
            .await
    }

    async fn list_stale_partitions(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Vec<StalePartitionFlag>> {
        self.list_stale_partitions_impl(workflow_definition_id).await
    }

    async fn find_auto_run_failure_state(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Option<AutoRunFailureState>> {
        self.find_auto_run_failure_state_impl(workflow_definition_id).await
    }

    async fn record_auto_run_failure(&self, state: AutoRunFailureState) -> AppResult<()> {
        self.record_auto_run_failure_impl(state).await
    }

    async fn clear_auto_run_failure(&self, workflow_definition_id: WorkflowId) -> AppResult<()> {
        self.clear_auto_run_failure_impl(workflow_definition_id).await
    }
}
