//! PostgreSQL-backed event schema store.

use async_trait::async_trait;
use apphub_application::EventSchemaStore;
use apphub_core::{AppError, AppResult};
use apphub_domain::{EventSchema, EventSchemaStatus};
use serde_json::Value;
use sqlx::PgPool;

/// PostgreSQL implementation of the event schema store port.
#[derive(Clone)]
pub struct PostgresSchemaStore {
    pool: PgPool,
}

impl PostgresSchemaStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSchemaStore for PostgresSchemaStore {
    async fn insert_schema(&self, schema: &EventSchema) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO event_schemas (
                event_type,
                version,
                status,
                schema,
                schema_hash,
                metadata,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (event_type, version) DO NOTHING
            "#,
        )
        .bind(schema.event_type.as_str())
        .bind(schema.version)
        .bind(schema.status.as_str())
        .bind(&schema.schema)
        .bind(schema.schema_hash.as_str())
        .bind(schema.metadata.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to insert event schema '{}' version {}: {error}",
                schema.event_type, schema.version
            ))
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "event schema '{}' version {} already exists",
                schema.event_type, schema.version
            )));
        }

        Ok(())
    }

    async fn find_schema(&self, event_type: &str, version: i32) -> AppResult<Option<EventSchema>> {
        let row = sqlx::query_as::<_, SchemaRow>(
            r#"
            SELECT event_type, version, status, schema, schema_hash, metadata
            FROM event_schemas
            WHERE event_type = $1 AND version = $2
            "#,
        )
        .bind(event_type)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load event schema '{event_type}' version {version}: {error}"
            ))
        })?;

        row.map(SchemaRow::into_schema).transpose()
    }

    async fn latest_schema(
        &self,
        event_type: &str,
        statuses: &[EventSchemaStatus],
    ) -> AppResult<Option<EventSchema>> {
        let status_values: Vec<&str> = statuses.iter().map(EventSchemaStatus::as_str).collect();

        let row = sqlx::query_as::<_, SchemaRow>(
            r#"
            SELECT event_type, version, status, schema, schema_hash, metadata
            FROM event_schemas
            WHERE event_type = $1 AND status = ANY($2)
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(event_type)
        .bind(status_values)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load latest event schema for '{event_type}': {error}"
            ))
        })?;

        row.map(SchemaRow::into_schema).transpose()
    }

    async fn max_version(&self, event_type: &str) -> AppResult<Option<i32>> {
        let row = sqlx::query_as::<_, MaxVersionRow>(
            r#"
            SELECT MAX(version) AS max_version
            FROM event_schemas
            WHERE event_type = $1
            "#,
        )
        .bind(event_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load max schema version for '{event_type}': {error}"
            ))
        })?;

        Ok(row.max_version)
    }

    async fn update_status(
        &self,
        event_type: &str,
        version: i32,
        status: EventSchemaStatus,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE event_schemas
            SET status = $3
            WHERE event_type = $1 AND version = $2
            "#,
        )
        .bind(event_type)
        .bind(version)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to update event schema '{event_type}' version {version}: {error}"
            ))
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "event schema '{event_type}' version {version} not found"
            )));
        }

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SchemaRow {
    event_type: String,
    version: i32,
    status: String,
    schema: Value,
    schema_hash: String,
    metadata: Option<Value>,
}

impl SchemaRow {
    fn into_schema(self) -> AppResult<EventSchema> {
        Ok(EventSchema {
            event_type: self.event_type,
            version: self.version,
            status: EventSchemaStatus::parse(self.status.as_str())?,
            schema: self.schema,
            schema_hash: self.schema_hash,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MaxVersionRow {
    max_version: Option<i32>,
}
