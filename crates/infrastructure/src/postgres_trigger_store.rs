//! PostgreSQL-backed event trigger store.

use async_trait::async_trait;
use apphub_application::TriggerStore;
use apphub_core::{AppError, AppResult, WorkflowId};
use apphub_domain::EventTrigger;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// PostgreSQL implementation of the trigger store port.
#[derive(Clone)]
pub struct PostgresTriggerStore {
    pool: PgPool,
}

impl PostgresTriggerStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerStore for PostgresTriggerStore {
    async fn list_triggers_for_event(&self, event_type: &str) -> AppResult<Vec<EventTrigger>> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT definition
            FROM event_triggers
            WHERE event_type = $1 AND is_enabled
            ORDER BY id
            "#,
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to list triggers for '{event_type}': {error}"))
        })?;

        rows.into_iter().map(TriggerRow::into_trigger).collect()
    }

    async fn find_trigger(&self, trigger_id: Uuid) -> AppResult<Option<EventTrigger>> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT definition
            FROM event_triggers
            WHERE id = $1
            "#,
        )
        .bind(trigger_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load trigger '{trigger_id}': {error}"))
        })?;

        row.map(TriggerRow::into_trigger).transpose()
    }

    async fn replace_workflow_triggers(
        &self,
        workflow_definition_id: WorkflowId,
        triggers: Vec<EventTrigger>,
    ) -> AppResult<()> {
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!("failed to start trigger replace transaction: {error}"))
        })?;

        sqlx::query(
            r#"
            DELETE FROM event_triggers
            WHERE workflow_definition_id = $1
            "#,
        )
        .bind(workflow_definition_id.as_uuid())
        .execute(&mut *transaction)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to delete triggers for '{workflow_definition_id}': {error}"
            ))
        })?;

        for trigger in &triggers {
            let definition = serde_json::to_value(trigger).map_err(|error| {
                AppError::Internal(format!("failed to serialize trigger '{}': {error}", trigger.id))
            })?;

            sqlx::query(
                r#"
                INSERT INTO event_triggers (
                    id,
                    workflow_definition_id,
                    event_type,
                    is_enabled,
                    definition,
                    created_at
                )
                VALUES ($1, $2, $3, $4, $5, now())
                "#,
            )
            .bind(trigger.id)
            .bind(trigger.workflow_definition_id.as_uuid())
            .bind(trigger.event_type.as_str())
            .bind(trigger.is_enabled)
            .bind(&definition)
            .execute(&mut *transaction)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to insert trigger '{}': {error}", trigger.id))
            })?;
        }

        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!("failed to commit trigger replace transaction: {error}"))
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TriggerRow {
    definition: Value,
}

impl TriggerRow {
    fn into_trigger(self) -> AppResult<EventTrigger> {
        serde_json::from_value(self.definition).map_err(|error| {
            AppError::Internal(format!("failed to decode stored event trigger: {error}"))
        })
    }
}
