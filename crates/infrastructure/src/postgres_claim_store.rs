//! PostgreSQL-backed auto-run claim store.
//!
//! The primary key on `workflow_definition_id` enforces at most one active
//! claim per workflow; acquisition is an `INSERT .. ON CONFLICT DO NOTHING`.

use async_trait::async_trait;
use apphub_application::{AutoRunClaim, AutoRunClaimStore, ClaimRelease};
use apphub_core::{AppError, AppResult, RunId, WorkflowId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// PostgreSQL implementation of the auto-run claim store port.
#[derive(Clone)]
pub struct PostgresClaimStore {
    pool: PgPool,
}

impl PostgresClaimStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutoRunClaimStore for PostgresClaimStore {
    async fn try_claim(&self, claim: AutoRunClaim) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_auto_run_claims (
                workflow_definition_id,
                owner_id,
                workflow_run_id,
                reason,
                asset_id,
                partition_key,
                acquired_at,
                expires_at
            )
            VALUES ($1, $2, NULL, $3, $4, $5, $6, $7)
            ON CONFLICT (workflow_definition_id) DO NOTHING
            "#,
        )
        .bind(claim.workflow_definition_id.as_uuid())
        .bind(claim.owner_id.as_str())
        .bind(claim.reason.as_str())
        .bind(claim.asset_id.as_str())
        .bind(claim.partition_key.as_deref())
        .bind(claim.acquired_at)
        .bind(claim.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to acquire auto-run claim for '{}': {error}",
                claim.workflow_definition_id
            ))
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn attach_run(
        &self,
        workflow_definition_id: WorkflowId,
        owner_id: &str,
        run_id: RunId,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_auto_run_claims
            SET workflow_run_id = $3
            WHERE workflow_definition_id = $1 AND owner_id = $2
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .bind(owner_id)
        .bind(run_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to attach run to claim for '{workflow_definition_id}': {error}"
            ))
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(
        &self,
        workflow_definition_id: WorkflowId,
        release: ClaimRelease,
    ) -> AppResult<()> {
        let result = match release {
            ClaimRelease::Owner(owner_id) => {
                sqlx::query(
                    r#"
                    DELETE FROM workflow_auto_run_claims
                    WHERE workflow_definition_id = $1 AND owner_id = $2
                    "#,
                )
                .bind(workflow_definition_id.as_uuid())
                .bind(owner_id)
                .execute(&self.pool)
                .await
            }
            ClaimRelease::Run(run_id) => {
                sqlx::query(
                    r#"
                    DELETE FROM workflow_auto_run_claims
                    WHERE workflow_definition_id = $1 AND workflow_run_id = $2
                    "#,
                )
                .bind(workflow_definition_id.as_uuid())
                .bind(run_id.as_uuid())
                .execute(&self.pool)
                .await
            }
        };

        result.map_err(|error| {
            AppError::Internal(format!(
                "failed to release auto-run claim for '{workflow_definition_id}': {error}"
            ))
        })?;

        Ok(())
    }

    async fn find_claim(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Option<AutoRunClaim>> {
        let row = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT workflow_definition_id, owner_id, workflow_run_id, reason, asset_id,
                   partition_key, acquired_at, expires_at
            FROM workflow_auto_run_claims
            WHERE workflow_definition_id = $1
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load auto-run claim for '{workflow_definition_id}': {error}"
            ))
        })?;

        Ok(row.map(ClaimRow::into_claim))
    }

    async fn cleanup_expired(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_auto_run_claims
            WHERE expires_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to cleanup expired auto-run claims: {error}"))
        })?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ClaimRow {
    workflow_definition_id: Uuid,
    owner_id: String,
    workflow_run_id: Option<Uuid>,
    reason: String,
    asset_id: String,
    partition_key: Option<String>,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl ClaimRow {
    fn into_claim(self) -> AutoRunClaim {
        AutoRunClaim {
            workflow_definition_id: WorkflowId::from_uuid(self.workflow_definition_id),
            owner_id: self.owner_id,
            workflow_run_id: self.workflow_run_id.map(RunId::from_uuid),
            reason: self.reason,
            asset_id: self.asset_id,
            partition_key: self.partition_key,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
        }
    }
}
