use async_trait::async_trait;
use apphub_core::{AppResult, RunId, WorkflowId};
use apphub_domain::WorkflowDefinition;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::execution::{
    AssetMaterialization, AutoRunFailureState, CompleteWorkflowRunInput, CreateRunOutcome,
    CreateWorkflowRunInput, StalePartitionFlag, WorkflowRun, WorkflowRunListQuery,
    WorkflowRunStepAsset, WorkflowStepRun,
};

/// Repository port for workflow definitions, runs, steps, and assets.
///
/// `create_run` is the linchpin: when the input carries a run key, the store
/// must enforce at most one non-terminal run per
/// `(workflow_definition_id, run_key_normalized)` and surface the existing
/// run on conflict instead of inserting.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Inserts one definition version; `(slug, version)` conflicts reject.
    async fn insert_definition(&self, definition: &WorkflowDefinition) -> AppResult<()>;

    /// Returns one definition by identifier, latest version.
    async fn find_definition(&self, id: WorkflowId) -> AppResult<Option<WorkflowDefinition>>;

    /// Returns the latest definition version for one slug.
    async fn find_definition_by_slug(&self, slug: &str) -> AppResult<Option<WorkflowDefinition>>;

    /// Lists latest definition versions.
    async fn list_definitions(&self) -> AppResult<Vec<WorkflowDefinition>>;

    /// Creates one run under the run-key uniqueness index.
    async fn create_run(&self, input: CreateWorkflowRunInput) -> AppResult<CreateRunOutcome>;

    /// Returns one run by identifier.
    async fn find_run(&self, run_id: RunId) -> AppResult<Option<WorkflowRun>>;

    /// Lists runs matching a query, newest first.
    async fn list_runs(&self, query: WorkflowRunListQuery) -> AppResult<Vec<WorkflowRun>>;

    /// Transitions one pending run to running.
    async fn mark_run_running(&self, run_id: RunId, started_at: DateTime<Utc>) -> AppResult<()>;

    /// Persists the shared scope mid-run.
    async fn update_run_shared(&self, run_id: RunId, shared: &Value) -> AppResult<()>;

    /// Marks one run terminal and persists its output.
    async fn complete_run(&self, input: CompleteWorkflowRunInput) -> AppResult<WorkflowRun>;

    /// Inserts or updates one step run keyed by `(run_id, step_id)`.
    async fn upsert_step_run(&self, run_id: RunId, step: &WorkflowStepRun) -> AppResult<()>;

    /// Lists step runs for one run in declaration order.
    async fn list_step_runs(&self, run_id: RunId) -> AppResult<Vec<WorkflowStepRun>>;

    /// Persists one produced asset and refreshes the latest snapshot for
    /// `(workflow, asset, partition)`.
    async fn record_step_asset(&self, asset: &WorkflowRunStepAsset) -> AppResult<()>;

    /// Lists assets produced by one run.
    async fn list_step_assets(&self, run_id: RunId) -> AppResult<Vec<WorkflowRunStepAsset>>;

    /// Lists latest materializations across all assets of one workflow.
    async fn latest_materializations(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Vec<AssetMaterialization>>;

    /// Returns the latest materialization for one asset partition.
    async fn find_latest_materialization(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id_normalized: &str,
        partition_key_normalized: &str,
    ) -> AppResult<Option<AssetMaterialization>>;

    /// Flags one asset partition as stale.
    async fn mark_partition_stale(&self, flag: &StalePartitionFlag) -> AppResult<()>;

    /// Clears a stale flag; absent flags are a no-op.
    async fn clear_partition_stale(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id_normalized: &str,
        partition_key: Option<&str>,
    ) -> AppResult<()>;

    /// Lists stale partition flags for one workflow.
    async fn list_stale_partitions(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Vec<StalePartitionFlag>>;

    /// Returns auto-run failure backoff state for one workflow.
    async fn find_auto_run_failure_state(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Option<AutoRunFailureState>>;

    /// Records one auto-run failure and its computed backoff.
    async fn record_auto_run_failure(&self, state: AutoRunFailureState) -> AppResult<()>;

    /// Clears auto-run failure state after a success.
    async fn clear_auto_run_failure(&self, workflow_definition_id: WorkflowId) -> AppResult<()>;
}
