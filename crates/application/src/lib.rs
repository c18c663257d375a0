//! Application services and ports for the workflow and asset core.

#![forbid(unsafe_code)]

mod asset_graph_service;
mod asset_materializer;
mod audit_ports;
mod event_bus;
mod event_ingress_service;
mod event_ports;
mod event_schema_service;
mod queue_ports;
mod run_claim_service;
mod runtime_scaling_service;
mod scaling_ports;
mod scheduler_ports;
mod trigger_service;
mod workflow_ports;
mod workflow_service;

#[cfg(test)]
mod test_support;

pub use asset_graph_service::{
    AssetGraph, AssetGraphEdge, AssetGraphNode, AssetGraphService, AssetStepRef,
};
pub use asset_materializer::{
    AssetMaterializer, ConsiderOutcome, DEFAULT_BASE_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS,
    DEFAULT_REFRESH_INTERVAL_MS, MaterializeCause, MaterializerConfig,
};
pub use audit_ports::{AuditAction, AuditEvent, AuditRepository};
pub use event_bus::{AssetExpiredNotice, AssetProducedNotice, CoreEvent, EventBus};
pub use event_ingress_service::{
    EventIngressService, IngestOutcome, IngressConfig, RetryOutcome,
};
pub use event_ports::{EventSchemaStore, EventStore, IngressRetry, TriggerStore};
pub use event_schema_service::{
    EventSchemaRegistry, ResolvedEventSchema, SCHEMA_CACHE_TTL_MS, SCHEMA_NEGATIVE_CACHE_TTL_MS,
};
pub use queue_ports::{
    EnqueueDisposition, JOB_EVENT_INGEST, JOB_EVENT_INGRESS_RETRY, JOB_TRIGGER_EVALUATE,
    JOB_TRIGGER_RETRY, JOB_WORKFLOW_RETRY, JOB_WORKFLOW_RUN, JobQueue, QueueCounts, QueueJob,
    QueueKey,
};
pub use run_claim_service::{DEFAULT_CLAIM_TTL_MS, RunClaimService};
pub use runtime_scaling_service::{
    ConcurrencyHandle, EffectiveScalingPolicy, RuntimeScalingService, ScalingAgent,
};
pub use scaling_ports::{
    ScalingAck, ScalingAckStatus, ScalingChannel, ScalingMessage, ScalingPolicy,
    ScalingPolicyStore, ScalingTargetConfig,
};
pub use scheduler_ports::{
    RateLimitDecision, SchedulerStateStore, SourceMetrics, SourceMetricsUpdate, SourcePauseState,
    SourceRateLimit, TriggerFailureDecision, TriggerMetricKind, TriggerMetrics,
    TriggerPauseState,
};
pub use trigger_service::{
    TriggerDecision, TriggerEvaluation, TriggerEvaluator, TriggerEvaluatorConfig,
};
pub use workflow_ports::{
    AssetMaterialization, AutoRunClaim, AutoRunClaimStore, AutoRunFailureState,
    ClaimRelease, CompleteWorkflowRunInput, CreateRunOutcome, CreateWorkflowRunInput,
    JobRunOutcome, JobRunRequest, JobRunStatus, JobRuntime, RegisteredService, SecretResolver,
    ServiceHealth, ServiceInvocation, ServiceInvoker, ServiceRegistry, ServiceResponse,
    StalePartitionFlag, WorkflowRun, WorkflowRunListQuery, WorkflowRunStatus,
    WorkflowRunStepAsset, WorkflowRunTrigger, WorkflowStepRun, WorkflowStepStatus, WorkflowStore,
};
pub use workflow_service::{
    DEFAULT_MAX_PARALLEL_STEPS, ExecutionOutcome, WorkflowService, WorkflowServiceDeps,
};
