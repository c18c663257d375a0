use async_trait::async_trait;
use apphub_core::AppResult;

/// Security-sensitive operation categories recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// A workflow definition was created.
    WorkflowDefinitionCreated,
    /// A workflow definition was updated to a new version.
    WorkflowDefinitionUpdated,
    /// A workflow run reached a terminal status.
    WorkflowRunCompleted,
    /// An event source was paused manually.
    EventSourcePaused,
    /// An event source pause was lifted manually.
    EventSourceResumed,
    /// An event trigger was paused after repeated failures.
    EventTriggerPaused,
    /// A runtime scaling policy was updated.
    ScalingPolicyUpdated,
}

impl AuditAction {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowDefinitionCreated => "workflow_definition_created",
            Self::WorkflowDefinitionUpdated => "workflow_definition_updated",
            Self::WorkflowRunCompleted => "workflow_run_completed",
            Self::EventSourcePaused => "event_source_paused",
            Self::EventSourceResumed => "event_source_resumed",
            Self::EventTriggerPaused => "event_trigger_paused",
            Self::ScalingPolicyUpdated => "scaling_policy_updated",
        }
    }
}

/// One immutable audit log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Acting identity, e.g. `worker:event-ingress` or an operator subject.
    pub actor: String,
    /// Operation category.
    pub action: AuditAction,
    /// Affected resource type.
    pub resource_type: String,
    /// Affected resource identifier.
    pub resource_id: String,
    /// Optional human-readable detail.
    pub detail: Option<String>,
}

/// Append-only audit log port.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Appends one audit event.
    async fn append_event(&self, event: AuditEvent) -> AppResult<()>;
}
