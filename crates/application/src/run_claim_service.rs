//! Auto-run claim registry: at most one claim per workflow while the
//! materializer schedules a run.

use std::sync::Arc;

use apphub_core::{AppResult, Clock, RunId, WorkflowId};
use chrono::Duration;
use tracing::info;

use crate::workflow_ports::{AutoRunClaim, AutoRunClaimStore, ClaimRelease};

/// Default claim lifetime before startup cleanup reclaims it.
pub const DEFAULT_CLAIM_TTL_MS: i64 = 600_000;

/// Claim registry service.
#[derive(Clone)]
pub struct RunClaimService {
    store: Arc<dyn AutoRunClaimStore>,
    clock: Arc<dyn Clock>,
    claim_ttl_ms: i64,
}

impl RunClaimService {
    /// Creates a claim service with the default TTL.
    #[must_use]
    pub fn new(store: Arc<dyn AutoRunClaimStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            claim_ttl_ms: DEFAULT_CLAIM_TTL_MS,
        }
    }

    /// Overrides the claim TTL.
    #[must_use]
    pub fn with_claim_ttl_ms(mut self, claim_ttl_ms: i64) -> Self {
        self.claim_ttl_ms = claim_ttl_ms;
        self
    }

    /// Acquires a claim; returns false when another owner holds one.
    pub async fn claim(
        &self,
        workflow_definition_id: WorkflowId,
        owner_id: &str,
        reason: &str,
        asset_id: &str,
        partition_key: Option<&str>,
    ) -> AppResult<bool> {
        let now = self.clock.now();
        self.store
            .try_claim(AutoRunClaim {
                workflow_definition_id,
                owner_id: owner_id.to_owned(),
                workflow_run_id: None,
                reason: reason.to_owned(),
                asset_id: asset_id.to_owned(),
                partition_key: partition_key.map(ToOwned::to_owned),
                acquired_at: now,
                expires_at: now + Duration::milliseconds(self.claim_ttl_ms),
            })
            .await
    }

    /// Binds a created run to the owned claim.
    pub async fn attach_run(
        &self,
        workflow_definition_id: WorkflowId,
        owner_id: &str,
        run_id: RunId,
    ) -> AppResult<bool> {
        self.store
            .attach_run(workflow_definition_id, owner_id, run_id)
            .await
    }

    /// Releases the claim held by one owner.
    pub async fn release_owner(
        &self,
        workflow_definition_id: WorkflowId,
        owner_id: &str,
    ) -> AppResult<()> {
        self.store
            .release(workflow_definition_id, ClaimRelease::Owner(owner_id.to_owned()))
            .await
    }

    /// Releases the claim bound to one run.
    pub async fn release_run(
        &self,
        workflow_definition_id: WorkflowId,
        run_id: RunId,
    ) -> AppResult<()> {
        self.store
            .release(workflow_definition_id, ClaimRelease::Run(run_id))
            .await
    }

    /// Returns the active claim for one workflow.
    pub async fn find_claim(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Option<AutoRunClaim>> {
        self.store.find_claim(workflow_definition_id).await
    }

    /// Deletes claims that outlived their TTL. Run at startup.
    pub async fn cleanup_expired(&self) -> AppResult<u64> {
        let removed = self.store.cleanup_expired(self.clock.now()).await?;
        if removed > 0 {
            info!(removed, "removed stale auto-run claims");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apphub_core::{ManualClock, RunId, WorkflowId};
    use chrono::{TimeZone, Utc};

    use crate::test_support::FakeClaimStore;

    use super::RunClaimService;

    fn service(clock: Arc<ManualClock>) -> (RunClaimService, Arc<FakeClaimStore>) {
        let store = Arc::new(FakeClaimStore::default());
        let service = RunClaimService::new(store.clone(), clock).with_claim_ttl_ms(1_000);
        (service, store)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now),
        ))
    }

    #[tokio::test]
    async fn at_most_one_claim_per_workflow() {
        let (service, _) = service(clock());
        let workflow_id = WorkflowId::new();

        let first = service.claim(workflow_id, "owner-a", "upstream-update", "a.raw", None).await;
        let second = service.claim(workflow_id, "owner-b", "expiry", "a.raw", None).await;
        assert_eq!(first.ok(), Some(true));
        assert_eq!(second.ok(), Some(false));
    }

    #[tokio::test]
    async fn release_by_run_frees_the_workflow() {
        let (service, _) = service(clock());
        let workflow_id = WorkflowId::new();
        let run_id = RunId::new();

        let claimed = service.claim(workflow_id, "owner-a", "expiry", "a.raw", None).await;
        assert_eq!(claimed.ok(), Some(true));
        let attached = service.attach_run(workflow_id, "owner-a", run_id).await;
        assert_eq!(attached.ok(), Some(true));

        let released = service.release_run(workflow_id, run_id).await;
        assert!(released.is_ok());

        let reclaimed = service.claim(workflow_id, "owner-b", "expiry", "a.raw", None).await;
        assert_eq!(reclaimed.ok(), Some(true));
    }

    #[tokio::test]
    async fn cleanup_removes_expired_claims() {
        let clock = clock();
        let (service, _) = service(clock.clone());
        let workflow_id = WorkflowId::new();

        let claimed = service.claim(workflow_id, "owner-a", "expiry", "a.raw", None).await;
        assert_eq!(claimed.ok(), Some(true));

        clock.advance_ms(2_000);
        let removed = service.cleanup_expired().await;
        assert_eq!(removed.ok(), Some(1));

        let reclaimed = service.claim(workflow_id, "owner-b", "expiry", "a.raw", None).await;
        assert_eq!(reclaimed.ok(), Some(true));
    }
}
