use apphub_core::{AppError, AppResult, WorkflowId};
use apphub_domain::{EventTrigger, WorkflowDefinition, WorkflowDefinitionInput};

use crate::audit_ports::{AuditAction, AuditEvent};
use crate::event_bus::CoreEvent;

use super::WorkflowService;

impl WorkflowService {
    /// Creates version 1 of a new workflow definition and registers its
    /// triggers.
    pub async fn create_definition(
        &self,
        actor: &str,
        input: WorkflowDefinitionInput,
    ) -> AppResult<WorkflowDefinition> {
        if self
            .store
            .find_definition_by_slug(input.slug.as_str())
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "workflow '{}' already exists; submit an update instead",
                input.slug
            )));
        }

        let definition = WorkflowDefinition::new(WorkflowDefinitionInput {
            version: 1,
            ..input
        })?;

        self.store.insert_definition(&definition).await?;
        self.register_triggers(&definition).await?;
        self.publish_definition_updated(&definition).await?;

        self.audit
            .append_event(AuditEvent {
                actor: actor.to_owned(),
                action: AuditAction::WorkflowDefinitionCreated,
                resource_type: "workflow_definition".to_owned(),
                resource_id: definition.slug().to_owned(),
                detail: Some(format!("version {}", definition.version())),
            })
            .await?;

        Ok(definition)
    }

    /// Publishes the next version of an existing definition.
    ///
    /// Definitions are never mutated in place; runs already in flight keep
    /// executing the version they started with.
    pub async fn update_definition(
        &self,
        actor: &str,
        slug: &str,
        input: WorkflowDefinitionInput,
    ) -> AppResult<WorkflowDefinition> {
        let Some(existing) = self.store.find_definition_by_slug(slug).await? else {
            return Err(AppError::NotFound(format!("workflow '{slug}' not found")));
        };

        let definition = WorkflowDefinition::with_id(
            existing.id(),
            WorkflowDefinitionInput {
                slug: existing.slug().to_owned(),
                version: existing.version() + 1,
                ..input
            },
        )?;

        self.store.insert_definition(&definition).await?;
        self.register_triggers(&definition).await?;
        self.publish_definition_updated(&definition).await?;

        self.audit
            .append_event(AuditEvent {
                actor: actor.to_owned(),
                action: AuditAction::WorkflowDefinitionUpdated,
                resource_type: "workflow_definition".to_owned(),
                resource_id: definition.slug().to_owned(),
                detail: Some(format!("version {}", definition.version())),
            })
            .await?;

        Ok(definition)
    }

    /// Returns the latest version of one definition by slug.
    pub async fn get_definition(&self, slug: &str) -> AppResult<WorkflowDefinition> {
        self.store
            .find_definition_by_slug(slug)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workflow '{slug}' not found")))
    }

    /// Returns the latest version of one definition by identifier.
    pub async fn get_definition_by_id(&self, id: WorkflowId) -> AppResult<WorkflowDefinition> {
        self.store
            .find_definition(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workflow '{id}' not found")))
    }

    /// Lists the latest version of every definition.
    pub async fn list_definitions(&self) -> AppResult<Vec<WorkflowDefinition>> {
        self.store.list_definitions().await
    }

    async fn register_triggers(&self, definition: &WorkflowDefinition) -> AppResult<()> {
        let triggers = definition
            .triggers()
            .iter()
            .cloned()
            .map(|input| EventTrigger::new(definition.id(), input))
            .collect::<AppResult<Vec<EventTrigger>>>()?;

        self.triggers
            .replace_workflow_triggers(definition.id(), triggers)
            .await
    }

    async fn publish_definition_updated(&self, definition: &WorkflowDefinition) -> AppResult<()> {
        self.bus
            .publish(CoreEvent::WorkflowDefinitionUpdated {
                workflow_definition_id: definition.id(),
                slug: definition.slug().to_owned(),
                version: definition.version(),
            })
            .await
    }
}
