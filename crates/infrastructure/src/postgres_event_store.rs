//! PostgreSQL-backed event envelope and ingress retry store.

use async_trait::async_trait;
use apphub_application::{EventStore, IngressRetry};
use apphub_core::{AppError, AppResult};
use apphub_domain::EventEnvelope;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

/// PostgreSQL implementation of the event store port.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn insert_envelope(&self, envelope: &EventEnvelope) -> AppResult<bool> {
        let row = sqlx::query_as::<_, InsertedRow>(
            r#"
            INSERT INTO event_envelopes (
                id,
                event_type,
                source,
                occurred_at,
                payload,
                correlation_id,
                ttl_ms,
                metadata,
                schema_version,
                schema_hash,
                received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
            ON CONFLICT (id) DO UPDATE
            SET
                metadata = EXCLUDED.metadata,
                schema_version = EXCLUDED.schema_version,
                schema_hash = EXCLUDED.schema_hash
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(envelope.id.as_str())
        .bind(envelope.event_type.as_str())
        .bind(envelope.source.as_str())
        .bind(envelope.occurred_at)
        .bind(&envelope.payload)
        .bind(envelope.correlation_id.as_deref())
        .bind(envelope.ttl_ms)
        .bind(envelope.metadata.as_ref())
        .bind(envelope.schema_version)
        .bind(envelope.schema_hash.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::RetryableExternal(format!(
                "failed to persist event envelope '{}': {error}",
                envelope.id
            ))
        })?;

        Ok(row.inserted)
    }

    async fn find_envelope(&self, event_id: &str) -> AppResult<Option<EventEnvelope>> {
        let row = sqlx::query_as::<_, EnvelopeRow>(
            r#"
            SELECT
                id, event_type, source, occurred_at, payload, correlation_id, ttl_ms, metadata,
                schema_version, schema_hash
            FROM event_envelopes
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load event envelope '{event_id}': {error}"))
        })?;

        Ok(row.map(EnvelopeRow::into_envelope))
    }

    async fn upsert_ingress_retry(&self, retry: &IngressRetry) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO event_ingress_retries (
                event_id,
                source,
                attempts,
                next_attempt_at,
                reason,
                cancelled,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (event_id) DO UPDATE
            SET
                attempts = EXCLUDED.attempts,
                next_attempt_at = EXCLUDED.next_attempt_at,
                reason = EXCLUDED.reason,
                cancelled = EXCLUDED.cancelled,
                updated_at = now()
            "#,
        )
        .bind(retry.event_id.as_str())
        .bind(retry.source.as_str())
        .bind(retry.attempts)
        .bind(retry.next_attempt_at)
        .bind(retry.reason.as_str())
        .bind(retry.cancelled)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to upsert ingress retry for '{}': {error}",
                retry.event_id
            ))
        })?;

        Ok(())
    }

    async fn find_ingress_retry(&self, event_id: &str) -> AppResult<Option<IngressRetry>> {
        let row = sqlx::query_as::<_, RetryRow>(
            r#"
            SELECT event_id, source, attempts, next_attempt_at, reason, cancelled
            FROM event_ingress_retries
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load ingress retry for '{event_id}': {error}"))
        })?;

        Ok(row.map(RetryRow::into_retry))
    }

    async fn delete_ingress_retry(&self, event_id: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM event_ingress_retries
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to delete ingress retry for '{event_id}': {error}"
            ))
        })?;

        Ok(())
    }

    async fn cancel_ingress_retry(&self, event_id: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE event_ingress_retries
            SET cancelled = TRUE, updated_at = now()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to cancel ingress retry for '{event_id}': {error}"
            ))
        })?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InsertedRow {
    inserted: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct EnvelopeRow {
    id: String,
    event_type: String,
    source: String,
    occurred_at: DateTime<Utc>,
    payload: Value,
    correlation_id: Option<String>,
    ttl_ms: Option<i64>,
    metadata: Option<Value>,
    schema_version: Option<i32>,
    schema_hash: Option<String>,
}

impl EnvelopeRow {
    fn into_envelope(self) -> EventEnvelope {
        EventEnvelope {
            id: self.id,
            event_type: self.event_type,
            source: self.source,
            occurred_at: self.occurred_at,
            payload: self.payload,
            correlation_id: self.correlation_id,
            ttl_ms: self.ttl_ms,
            metadata: self.metadata,
            schema_version: self.schema_version,
            schema_hash: self.schema_hash,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RetryRow {
    event_id: String,
    source: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    reason: String,
    cancelled: bool,
}

impl RetryRow {
    fn into_retry(self) -> IngressRetry {
        IngressRetry {
            event_id: self.event_id,
            source: self.source,
            attempts: self.attempts,
            next_attempt_at: self.next_attempt_at,
            reason: self.reason,
            cancelled: self.cancelled,
        }
    }
}
