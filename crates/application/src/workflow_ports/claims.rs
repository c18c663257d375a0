use async_trait::async_trait;
use apphub_core::{AppResult, RunId, WorkflowId};
use chrono::{DateTime, Utc};

/// Exclusive token held by the materializer while it schedules an auto run.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoRunClaim {
    /// Claimed workflow definition; at most one active claim per workflow.
    pub workflow_definition_id: WorkflowId,
    /// Claiming materializer instance.
    pub owner_id: String,
    /// Run bound to the claim once created.
    pub workflow_run_id: Option<RunId>,
    /// Why the auto run was scheduled: `upstream-update` or `expiry`.
    pub reason: String,
    /// Normalized asset identifier that caused the claim.
    pub asset_id: String,
    /// Affected partition key.
    pub partition_key: Option<String>,
    /// Claim acquisition timestamp.
    pub acquired_at: DateTime<Utc>,
    /// Expiry after which the claim counts as stale.
    pub expires_at: DateTime<Utc>,
}

/// Selector for releasing one claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimRelease {
    /// Release by claiming owner.
    Owner(String),
    /// Release by bound run identifier.
    Run(RunId),
}

/// Store port for auto-run claims.
#[async_trait]
pub trait AutoRunClaimStore: Send + Sync {
    /// Acquires a claim; returns false when an active claim already exists.
    async fn try_claim(&self, claim: AutoRunClaim) -> AppResult<bool>;

    /// Binds a newly created run to an owned claim.
    async fn attach_run(
        &self,
        workflow_definition_id: WorkflowId,
        owner_id: &str,
        run_id: RunId,
    ) -> AppResult<bool>;

    /// Releases one claim; absent claims are a no-op.
    async fn release(
        &self,
        workflow_definition_id: WorkflowId,
        release: ClaimRelease,
    ) -> AppResult<()>;

    /// Returns the active claim for one workflow.
    async fn find_claim(&self, workflow_definition_id: WorkflowId)
    -> AppResult<Option<AutoRunClaim>>;

    /// Deletes claims that expired before the cutoff; returns the count.
    async fn cleanup_expired(&self, before: DateTime<Utc>) -> AppResult<u64>;
}
