//! PostgreSQL-backed runtime scaling policy store.

use async_trait::async_trait;
use apphub_application::{
    QueueKey, ScalingAck, ScalingAckStatus, ScalingPolicy, ScalingPolicyStore,
};
use apphub_core::{AppError, AppResult};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// PostgreSQL implementation of the scaling policy store port.
#[derive(Clone)]
pub struct PostgresScalingStore {
    pool: PgPool,
}

impl PostgresScalingStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScalingPolicyStore for PostgresScalingStore {
    async fn find_policy(&self, target: QueueKey) -> AppResult<Option<ScalingPolicy>> {
        let row = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT target, desired_concurrency, updated_at, updated_by, reason
            FROM runtime_scaling_policies
            WHERE target = $1
            "#,
        )
        .bind(target.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load scaling policy for '{target}': {error}"))
        })?;

        row.map(PolicyRow::into_policy).transpose()
    }

    async fn upsert_policy(&self, policy: &ScalingPolicy) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_scaling_policies (
                target, desired_concurrency, updated_at, updated_by, reason
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (target) DO UPDATE
            SET
                desired_concurrency = EXCLUDED.desired_concurrency,
                updated_at = EXCLUDED.updated_at,
                updated_by = EXCLUDED.updated_by,
                reason = EXCLUDED.reason
            "#,
        )
        .bind(policy.target.as_str())
        .bind(policy.desired_concurrency)
        .bind(policy.updated_at)
        .bind(policy.updated_by.as_str())
        .bind(policy.reason.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to upsert scaling policy for '{}': {error}",
                policy.target
            ))
        })?;

        Ok(())
    }

    async fn record_ack(&self, ack: &ScalingAck) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_scaling_acks (
                target, instance_id, applied_concurrency, status, error, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(ack.target.as_str())
        .bind(ack.instance_id.as_str())
        .bind(ack.applied_concurrency)
        .bind(ack.status.as_str())
        .bind(ack.error.as_deref())
        .bind(ack.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to record scaling ack for '{}': {error}",
                ack.target
            ))
        })?;

        Ok(())
    }

    async fn list_acks(&self, target: QueueKey, limit: usize) -> AppResult<Vec<ScalingAck>> {
        let rows = sqlx::query_as::<_, AckRow>(
            r#"
            SELECT target, instance_id, applied_concurrency, status, error, recorded_at
            FROM runtime_scaling_acks
            WHERE target = $1
            ORDER BY recorded_at DESC
            LIMIT $2
            "#,
        )
        .bind(target.as_str())
        .bind(i64::try_from(limit.min(500)).unwrap_or(50))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to list scaling acks for '{target}': {error}"))
        })?;

        rows.into_iter().map(AckRow::into_ack).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PolicyRow {
    target: String,
    desired_concurrency: i32,
    updated_at: DateTime<Utc>,
    updated_by: String,
    reason: Option<String>,
}

impl PolicyRow {
    fn into_policy(self) -> AppResult<ScalingPolicy> {
        Ok(ScalingPolicy {
            target: QueueKey::parse(self.target.as_str())?,
            desired_concurrency: self.desired_concurrency,
            updated_at: self.updated_at,
            updated_by: self.updated_by,
            reason: self.reason,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AckRow {
    target: String,
    instance_id: String,
    applied_concurrency: i32,
    status: String,
    error: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl AckRow {
    fn into_ack(self) -> AppResult<ScalingAck> {
        let status = match self.status.as_str() {
            "applied" => ScalingAckStatus::Applied,
            "failed" => ScalingAckStatus::Failed,
            other => {
                return Err(AppError::Validation(format!(
                    "unknown scaling ack status '{other}'"
                )));
            }
        };

        Ok(ScalingAck {
            target: QueueKey::parse(self.target.as_str())?,
            instance_id: self.instance_id,
            applied_concurrency: self.applied_concurrency,
            status,
            error: self.error,
            recorded_at: self.recorded_at,
        })
    }
}
