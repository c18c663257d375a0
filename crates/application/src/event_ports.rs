//! Ports for event persistence, schemas, and triggers.

use async_trait::async_trait;
use apphub_core::{AppResult, WorkflowId};
use apphub_domain::{EventEnvelope, EventSchema, EventSchemaStatus, EventTrigger};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One scheduled ingress retry for a throttled or paused source.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressRetry {
    /// Affected envelope identifier.
    pub event_id: String,
    /// Envelope source, kept for pause re-evaluation.
    pub source: String,
    /// Retry attempts so far, 1-based.
    pub attempts: i32,
    /// Scheduled next attempt time.
    pub next_attempt_at: DateTime<Utc>,
    /// Why the retry was scheduled.
    pub reason: String,
    /// Cancelled retries are dropped silently when their job fires.
    pub cancelled: bool,
}

/// Store port for immutable envelopes and their scheduled retries.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists one envelope; duplicate identifiers upsert and return false.
    async fn insert_envelope(&self, envelope: &EventEnvelope) -> AppResult<bool>;

    /// Returns one envelope by identifier.
    async fn find_envelope(&self, event_id: &str) -> AppResult<Option<EventEnvelope>>;

    /// Inserts or replaces the retry row for one envelope.
    async fn upsert_ingress_retry(&self, retry: &IngressRetry) -> AppResult<()>;

    /// Returns the retry row for one envelope.
    async fn find_ingress_retry(&self, event_id: &str) -> AppResult<Option<IngressRetry>>;

    /// Deletes the retry row for one envelope.
    async fn delete_ingress_retry(&self, event_id: &str) -> AppResult<()>;

    /// Marks the retry row cancelled; returns whether it existed.
    async fn cancel_ingress_retry(&self, event_id: &str) -> AppResult<bool>;
}

/// Store port for registered event schemas.
#[async_trait]
pub trait EventSchemaStore: Send + Sync {
    /// Inserts one schema version; `(event_type, version)` conflicts reject.
    async fn insert_schema(&self, schema: &EventSchema) -> AppResult<()>;

    /// Returns one schema by `(event_type, version)`.
    async fn find_schema(&self, event_type: &str, version: i32)
    -> AppResult<Option<EventSchema>>;

    /// Returns the newest schema among the given statuses.
    async fn latest_schema(
        &self,
        event_type: &str,
        statuses: &[EventSchemaStatus],
    ) -> AppResult<Option<EventSchema>>;

    /// Returns the highest registered version for one event type.
    async fn max_version(&self, event_type: &str) -> AppResult<Option<i32>>;

    /// Updates the status of one schema version.
    async fn update_status(
        &self,
        event_type: &str,
        version: i32,
        status: EventSchemaStatus,
    ) -> AppResult<()>;
}

/// Store port for event triggers.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Lists enabled triggers listening for one event type.
    async fn list_triggers_for_event(&self, event_type: &str) -> AppResult<Vec<EventTrigger>>;

    /// Returns one trigger by identifier.
    async fn find_trigger(&self, trigger_id: Uuid) -> AppResult<Option<EventTrigger>>;

    /// Replaces the trigger set registered for one workflow definition.
    async fn replace_workflow_triggers(
        &self,
        workflow_definition_id: WorkflowId,
        triggers: Vec<EventTrigger>,
    ) -> AppResult<()>;
}
