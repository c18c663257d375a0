//! PostgreSQL-backed append-only audit log.

use async_trait::async_trait;
use apphub_application::{AuditEvent, AuditRepository};
use apphub_core::{AppError, AppResult};
use sqlx::PgPool;

/// PostgreSQL implementation of the audit repository port.
#[derive(Clone)]
pub struct PostgresAuditLogRepository {
    pool: PgPool,
}

impl PostgresAuditLogRepository {
    /// Creates a repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PostgresAuditLogRepository {
    async fn append_event(&self, event: AuditEvent) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (actor, action, resource_type, resource_id, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(event.actor.as_str())
        .bind(event.action.as_str())
        .bind(event.resource_type.as_str())
        .bind(event.resource_id.as_str())
        .bind(event.detail.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to append audit event: {error}")))?;

        Ok(())
    }
}
