//! Domain entities and invariants for the workflow and asset core.

#![forbid(unsafe_code)]

mod asset;
mod bundle;
mod event;
mod retry;
mod template;
mod trigger;
mod workflow;

pub use asset::{
    AssetConsumption, AssetDeclaration, AssetPartitioning, AutoMaterializePolicy, FreshnessPolicy,
    PartitionWindow, ProducedAsset, WindowGranularity, extract_produced_assets,
    normalize_asset_id, normalize_partition_key, partition_window,
};
pub use bundle::{BundleRuntime, JobBundleManifest, bundle_checksum};
pub use event::{
    EventEnvelope, EventEnvelopeInput, EventSchema, EventSchemaInput, EventSchemaStatus,
};
pub use retry::{
    BackoffConfig, JitterMode, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY_MS, RetryPolicy, RetryStrategy,
};
pub use template::{
    TemplateScope, merge_parameter_layers, resolve_template_string, resolve_template_value,
};
pub use trigger::{
    EventTrigger, EventTriggerInput, TriggerCondition, TriggerConditionOperator, TriggerPredicate,
    TriggerThrottle, envelope_scope,
};
pub use workflow::{
    FAN_OUT_MAX_CONCURRENCY, FAN_OUT_MAX_ITEMS, FanOutTemplate, ServiceHeaderValue,
    ServiceRequest, WORKFLOW_MAX_STEPS, WORKFLOW_SLUG_MAX_LENGTH, WorkflowDefinition,
    WorkflowDefinitionInput, WorkflowStep, WorkflowStepKind,
};
