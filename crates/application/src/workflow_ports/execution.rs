use apphub_core::{AppError, AppResult, RunId, WorkflowId};
use apphub_domain::FreshnessPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    /// Created, not yet picked up by a worker.
    Pending,
    /// Executing on a worker.
    Running,
    /// All steps finished successfully.
    Succeeded,
    /// A step failed terminally.
    Failed,
    /// Cancelled by external request.
    Canceled,
}

impl WorkflowRunStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(AppError::Validation(format!(
                "unknown workflow run status '{value}'"
            ))),
        }
    }

    /// Returns whether the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Lifecycle status of one step inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStepStatus {
    /// Not yet started, or waiting for a scheduled retry.
    Pending,
    /// Executing an attempt.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Exhausted attempts or failed terminally.
    Failed,
    /// Skipped; counted as success with no value.
    Skipped,
}

impl WorkflowStepStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(AppError::Validation(format!(
                "unknown workflow step status '{value}'"
            ))),
        }
    }

    /// Returns whether downstream steps may proceed past this status.
    #[must_use]
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

/// Origin of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunTrigger {
    /// Trigger category: `manual`, `event`, or `auto-materialize`.
    #[serde(rename = "type")]
    pub trigger_type: String,
    /// Trigger-specific payload captured for observability.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl WorkflowRunTrigger {
    /// Creates a manual trigger record.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            trigger_type: "manual".to_owned(),
            payload: Value::Null,
        }
    }
}

/// Run creation payload handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateWorkflowRunInput {
    /// Target workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Optional caller-provided logical run identity.
    pub run_key: Option<String>,
    /// Effective run parameters.
    pub parameters: Value,
    /// Run origin.
    pub trigger: WorkflowRunTrigger,
    /// Acting identity that requested the run.
    pub triggered_by: Option<String>,
    /// Optional run-level partition key.
    pub partition_key: Option<String>,
}

/// Result of a run creation attempt under the run-key uniqueness index.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateRunOutcome {
    /// A new run row was inserted.
    Created(WorkflowRun),
    /// An active run already holds the normalized key; the caller may
    /// re-enqueue it idempotently.
    Existing(WorkflowRun),
}

impl CreateRunOutcome {
    /// Returns the run regardless of outcome.
    #[must_use]
    pub fn run(&self) -> &WorkflowRun {
        match self {
            Self::Created(run) | Self::Existing(run) => run,
        }
    }

    /// Returns whether a new run was inserted.
    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Persisted workflow run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Stable run identifier.
    pub id: RunId,
    /// Executed workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Lifecycle status.
    pub status: WorkflowRunStatus,
    /// Caller-provided run key, original form.
    pub run_key: Option<String>,
    /// Normalized run key used by the uniqueness index.
    pub run_key_normalized: Option<String>,
    /// Effective run parameters.
    pub parameters: Value,
    /// Run origin.
    pub trigger: WorkflowRunTrigger,
    /// Acting identity that requested the run.
    pub triggered_by: Option<String>,
    /// Optional run-level partition key.
    pub partition_key: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Execution start timestamp.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// First fatal step error, truncated.
    pub error_message: Option<String>,
    /// Values stored by steps; becomes the run output on completion.
    pub shared: Value,
}

/// Run completion payload handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteWorkflowRunInput {
    /// Run identifier.
    pub run_id: RunId,
    /// Terminal status.
    pub status: WorkflowRunStatus,
    /// First fatal step error, truncated.
    pub error_message: Option<String>,
    /// Final shared scope persisted as the run output.
    pub shared: Value,
    /// Terminal timestamp.
    pub completed_at: DateTime<Utc>,
}

/// Persisted record of one step inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepRun {
    /// Step identifier inside the definition, or an expanded fan-out child id.
    pub step_id: String,
    /// Fan-out parent step id for expanded children.
    pub parent_step_id: Option<String>,
    /// Lifecycle status.
    pub status: WorkflowStepStatus,
    /// 1-based attempt counter.
    pub attempt: i32,
    /// Identifier reported by the job runtime collaborator.
    pub job_run_id: Option<String>,
    /// Step result value.
    pub result: Option<Value>,
    /// Failure message, truncated.
    pub error_message: Option<String>,
    /// Stable error kind of the last failure.
    pub error_kind: Option<String>,
    /// Earliest time the next attempt may start after a scheduled retry.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// First attempt start timestamp.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted record of one asset produced by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunStepAsset {
    /// Producing run.
    pub run_id: RunId,
    /// Producing workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Producing step.
    pub step_id: String,
    /// Declared asset identifier, original form.
    pub asset_id: String,
    /// Normalized asset identifier used for lookups.
    pub asset_id_normalized: String,
    /// Partition key, original form.
    pub partition_key: Option<String>,
    /// Normalized partition key; empty for unpartitioned assets.
    pub partition_key_normalized: String,
    /// Production timestamp.
    pub produced_at: DateTime<Utc>,
    /// Asset payload.
    pub payload: Value,
    /// Optional payload schema reported by the step.
    pub schema: Option<Value>,
    /// Optional freshness override reported by the step.
    pub freshness: Option<FreshnessPolicy>,
}

/// Latest-per-`(workflow, asset, partition)` materialization snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMaterialization {
    /// Producing workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Producing workflow slug.
    pub workflow_slug: String,
    /// Producing run.
    pub run_id: RunId,
    /// Producing step.
    pub step_id: String,
    /// Normalized asset identifier.
    pub asset_id: String,
    /// Partition key, original form.
    pub partition_key: Option<String>,
    /// Production timestamp.
    pub produced_at: DateTime<Utc>,
}

/// Operator request flagging one asset partition as stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalePartitionFlag {
    /// Producing workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Normalized asset identifier.
    pub asset_id: String,
    /// Flagged partition key; absent flags the unpartitioned snapshot.
    pub partition_key: Option<String>,
    /// Request timestamp.
    pub requested_at: DateTime<Utc>,
    /// Requesting identity.
    pub requested_by: String,
    /// Optional operator note.
    pub note: Option<String>,
}

/// Auto-materialization failure backoff state for one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoRunFailureState {
    /// Affected workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Consecutive auto-run failures.
    pub failures: i32,
    /// Earliest time another auto run may be considered.
    pub next_eligible_at: Option<DateTime<Utc>>,
}

/// Run listing query.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRunListQuery {
    /// Optional workflow definition filter.
    pub workflow_definition_id: Option<WorkflowId>,
    /// Optional status filter.
    pub status: Option<WorkflowRunStatus>,
    /// Page size.
    pub limit: usize,
    /// Row offset.
    pub offset: usize,
}
