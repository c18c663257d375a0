use apphub_core::{AppError, AppResult, WorkflowId};
use apphub_domain::WorkflowDefinition;
use serde_json::Value;

use super::PostgresWorkflowStore;

impl PostgresWorkflowStore {
    pub(super) async fn insert_definition_impl(
        &self,
        definition: &WorkflowDefinition,
    ) -> AppResult<()> {
        let document = serde_json::to_value(definition).map_err(|error| {
            AppError::Internal(format!(
                "failed to serialize workflow definition '{}': {error}",
                definition.slug()
            ))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, slug, version, name, definition, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (slug, version) DO NOTHING
            "#,
        )
        .bind(definition.id().as_uuid())
        .bind(definition.slug())
        .bind(definition.version())
        .bind(definition.name().as_str())
        .bind(&document)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to insert workflow definition '{}': {error}",
                definition.slug()
            ))
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "workflow '{}' version {} already exists",
                definition.slug(),
                definition.version()
            )));
        }

        Ok(())
    }

    pub(super) async fn find_definition_impl(
        &self,
        id: WorkflowId,
    ) -> AppResult<Option<WorkflowDefinition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT definition
            FROM workflow_definitions
            WHERE id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load workflow definition '{id}': {error}"))
        })?;

        row.map(DefinitionRow::into_definition).transpose()
    }

    pub(super) async fn find_definition_by_slug_impl(
        &self,
        slug: &str,
    ) -> AppResult<Option<WorkflowDefinition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT definition
            FROM workflow_definitions
            WHERE slug = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load workflow definition '{slug}': {error}"))
        })?;

        row.map(DefinitionRow::into_definition).transpose()
    }

    pub(super) async fn list_definitions_impl(&self) -> AppResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT DISTINCT ON (slug) definition
            FROM workflow_definitions
            ORDER BY slug, version DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to list workflow definitions: {error}"))
        })?;

        rows.into_iter().map(DefinitionRow::into_definition).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DefinitionRow {
    definition: Value,
}

impl DefinitionRow {
    fn into_definition(self) -> AppResult<WorkflowDefinition> {
        serde_json::from_value(self.definition).map_err(|error| {
            AppError::Internal(format!("failed to decode stored workflow definition: {error}"))
        })
    }
}
