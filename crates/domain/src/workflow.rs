use std::collections::BTreeMap;
use std::collections::HashSet;

use apphub_core::{AppError, AppResult, NonEmptyString, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::asset::{AssetConsumption, AssetDeclaration};
use crate::retry::RetryPolicy;
use crate::trigger::EventTriggerInput;

/// Upper bound on steps per workflow definition.
pub const WORKFLOW_MAX_STEPS: usize = 100;
/// Upper bound on workflow slug length.
pub const WORKFLOW_SLUG_MAX_LENGTH: usize = 100;
/// Upper bound on fan-out collection size.
pub const FAN_OUT_MAX_ITEMS: usize = 10_000;
/// Upper bound on fan-out concurrency.
pub const FAN_OUT_MAX_CONCURRENCY: usize = 1_000;

/// Header value in a service step request; either literal or a secret lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceHeaderValue {
    /// Literal header value, may contain template placeholders.
    Plain(String),
    /// Reference resolved through the secret resolver at call time.
    Secret {
        /// Secret name to resolve.
        secret: String,
    },
}

/// Outbound request template for a service step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// HTTP method.
    pub method: String,
    /// Request path appended to the registered service base URL.
    pub path: String,
    /// Request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, ServiceHeaderValue>,
    /// Query parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    /// Optional JSON body, resolved against the template scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

const ALLOWED_METHODS: [&str; 7] = ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

/// Behavior variant of one workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStepKind {
    /// Dispatch a job bundle through the job runtime collaborator.
    Job {
        /// Registered job bundle slug.
        job_slug: String,
        /// Step parameters merged over run parameters.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        parameters: Value,
        /// Shared-scope key that receives the job result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_result_as: Option<String>,
    },
    /// Call a registered runtime service over HTTP.
    Service {
        /// Registered service slug.
        service_slug: String,
        /// Request template.
        request: ServiceRequest,
        /// Require the service to report healthy before calling.
        #[serde(default = "default_true")]
        require_healthy: bool,
        /// Accept a degraded service when health is required.
        #[serde(default)]
        allow_degraded: bool,
        /// Capture the response body into the step result.
        #[serde(default)]
        capture_response: bool,
        /// Shared-scope key that receives the captured response.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_response_as: Option<String>,
    },
    /// Expand a collection into templated child steps.
    FanOut {
        /// Template expression resolving to an array.
        collection: Value,
        /// Child step instantiated per collection item.
        template: Box<FanOutTemplate>,
        /// Maximum accepted collection length.
        #[serde(default = "default_fan_out_max_items")]
        max_items: usize,
        /// Maximum child steps running at once.
        #[serde(default = "default_fan_out_max_concurrency")]
        max_concurrency: usize,
        /// Shared-scope key that receives ordered child results.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_results_as: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

fn default_fan_out_max_items() -> usize {
    FAN_OUT_MAX_ITEMS
}

fn default_fan_out_max_concurrency() -> usize {
    FAN_OUT_MAX_CONCURRENCY
}

/// Child step template expanded per fan-out item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutTemplate {
    /// Identifier prefix for expanded child steps.
    pub id: String,
    /// Display name for expanded child steps.
    pub name: String,
    /// Child behavior; fan-out nesting is rejected at validation.
    #[serde(flatten)]
    pub kind: WorkflowStepKind,
}

/// One step in a workflow definition DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Stable step identifier, unique within the definition.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Identifiers of steps that must finish before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Optional per-step retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Optional per-attempt deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    /// Assets this step declares it produces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<AssetDeclaration>,
    /// Assets this step consumes from upstream workflows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<AssetConsumption>,
    /// Behavior variant.
    #[serde(flatten)]
    pub kind: WorkflowStepKind,
}

/// Validated, versioned workflow definition.
///
/// Definitions are immutable once created; updates produce a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    id: WorkflowId,
    slug: String,
    name: NonEmptyString,
    version: i32,
    steps: Vec<WorkflowStep>,
    default_parameters: Value,
    triggers: Vec<EventTriggerInput>,
}

/// Input payload used to construct a validated workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinitionInput {
    /// Stable workflow slug.
    pub slug: String,
    /// User-facing workflow name.
    pub name: String,
    /// Definition version, starting at 1.
    pub version: i32,
    /// Ordered step DAG.
    pub steps: Vec<WorkflowStep>,
    /// Defaults merged under run parameters.
    pub default_parameters: Value,
    /// Event triggers registered with this definition.
    pub triggers: Vec<EventTriggerInput>,
}

impl WorkflowDefinition {
    /// Creates a validated workflow definition with a fresh identifier.
    pub fn new(input: WorkflowDefinitionInput) -> AppResult<Self> {
        Self::with_id(WorkflowId::new(), input)
    }

    /// Creates a validated workflow definition with a known identifier.
    pub fn with_id(id: WorkflowId, input: WorkflowDefinitionInput) -> AppResult<Self> {
        let WorkflowDefinitionInput {
            slug,
            name,
            version,
            steps,
            default_parameters,
            triggers,
        } = input;

        validate_slug(slug.as_str())?;

        if version < 1 {
            return Err(AppError::Validation(
                "workflow version must be at least 1".to_owned(),
            ));
        }

        if !default_parameters.is_null() && !default_parameters.is_object() {
            return Err(AppError::Validation(
                "workflow default_parameters must be a JSON object".to_owned(),
            ));
        }

        validate_steps(steps.as_slice())?;

        for trigger in &triggers {
            trigger.validate()?;
        }

        Ok(Self {
            id,
            slug,
            name: NonEmptyString::new(name)?,
            version,
            steps,
            default_parameters,
            triggers,
        })
    }

    /// Returns the stable definition identifier.
    #[must_use]
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    /// Returns the workflow slug.
    #[must_use]
    pub fn slug(&self) -> &str {
        self.slug.as_str()
    }

    /// Returns the workflow display name.
    #[must_use]
    pub fn name(&self) -> &NonEmptyString {
        &self.name
    }

    /// Returns the definition version.
    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Returns the ordered step DAG.
    #[must_use]
    pub fn steps(&self) -> &[WorkflowStep] {
        self.steps.as_slice()
    }

    /// Returns one step by identifier.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// Returns defaults merged under run parameters.
    #[must_use]
    pub fn default_parameters(&self) -> &Value {
        &self.default_parameters
    }

    /// Returns triggers registered with this definition.
    #[must_use]
    pub fn triggers(&self) -> &[EventTriggerInput] {
        self.triggers.as_slice()
    }

    /// Returns every asset declaration across all steps.
    #[must_use]
    pub fn produced_assets(&self) -> Vec<&AssetDeclaration> {
        self.steps.iter().flat_map(|step| step.produces.iter()).collect()
    }

    /// Returns every asset consumption across all steps.
    #[must_use]
    pub fn consumed_assets(&self) -> Vec<&AssetConsumption> {
        self.steps.iter().flat_map(|step| step.consumes.iter()).collect()
    }
}

fn validate_slug(slug: &str) -> AppResult<()> {
    if slug.is_empty() || slug.len() > WORKFLOW_SLUG_MAX_LENGTH {
        return Err(AppError::Validation(format!(
            "workflow slug must be 1..={WORKFLOW_SLUG_MAX_LENGTH} characters"
        )));
    }

    let mut characters = slug.chars();
    let leading_valid = characters.next().is_some_and(|first| first.is_ascii_alphanumeric());
    if !leading_valid || !characters.all(|rest| rest.is_ascii_alphanumeric() || matches!(rest, '-' | '_')) {
        return Err(AppError::Validation(format!(
            "workflow slug '{slug}' must start alphanumeric and contain only alphanumerics, '-' or '_'"
        )));
    }

    Ok(())
}

fn validate_steps(steps: &[WorkflowStep]) -> AppResult<()> {
    if steps.is_empty() {
        return Err(AppError::Validation(
            "workflow steps must include at least one step".to_owned(),
        ));
    }

    if steps.len() > WORKFLOW_MAX_STEPS {
        return Err(AppError::Validation(format!(
            "workflow steps must include at most {WORKFLOW_MAX_STEPS} steps"
        )));
    }

    // Dependencies may only reference earlier steps, which rules out cycles.
    let mut seen: HashSet<&str> = HashSet::with_capacity(steps.len());
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(AppError::Validation(
                "workflow step id must not be empty".to_owned(),
            ));
        }

        if step.name.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "workflow step '{}' name must not be empty",
                step.id
            )));
        }

        if !seen.insert(step.id.as_str()) {
            return Err(AppError::Validation(format!(
                "workflow step id '{}' is duplicated",
                step.id
            )));
        }

        for dependency in &step.depends_on {
            if dependency == &step.id {
                return Err(AppError::Validation(format!(
                    "workflow step '{}' must not depend on itself",
                    step.id
                )));
            }

            if !seen.contains(dependency.as_str()) {
                return Err(AppError::Validation(format!(
                    "workflow step '{}' depends on unknown or later step '{dependency}'",
                    step.id
                )));
            }
        }

        if let Some(policy) = &step.retry_policy {
            policy.validate()?;
        }

        if let Some(timeout_ms) = step.timeout_ms
            && timeout_ms <= 0
        {
            return Err(AppError::Validation(format!(
                "workflow step '{}' timeout_ms must be greater than zero",
                step.id
            )));
        }

        for declaration in &step.produces {
            if declaration.asset_id.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "workflow step '{}' declares an asset without an id",
                    step.id
                )));
            }
        }

        for consumption in &step.consumes {
            if consumption.asset_id.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "workflow step '{}' consumes an asset without an id",
                    step.id
                )));
            }
        }

        validate_step_kind(step.id.as_str(), &step.kind, true)?;
    }

    Ok(())
}

fn validate_step_kind(step_id: &str, kind: &WorkflowStepKind, allow_fan_out: bool) -> AppResult<()> {
    match kind {
        WorkflowStepKind::Job { job_slug, parameters, .. } => {
            if job_slug.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' job_slug must not be empty"
                )));
            }

            if !parameters.is_null() && !parameters.is_object() {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' parameters must be a JSON object"
                )));
            }

            Ok(())
        }
        WorkflowStepKind::Service { service_slug, request, .. } => {
            if service_slug.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' service_slug must not be empty"
                )));
            }

            let method = request.method.to_ascii_uppercase();
            if !ALLOWED_METHODS.contains(&method.as_str()) {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' request method '{}' is not supported",
                    request.method
                )));
            }

            if request.path.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' request path must not be empty"
                )));
            }

            Ok(())
        }
        WorkflowStepKind::FanOut {
            collection,
            template,
            max_items,
            max_concurrency,
            ..
        } => {
            if !allow_fan_out {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' fan-out templates must not nest fan-out steps"
                )));
            }

            if collection.is_null() {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' fan-out collection must not be null"
                )));
            }

            if *max_items == 0 || *max_items > FAN_OUT_MAX_ITEMS {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' max_items must be 1..={FAN_OUT_MAX_ITEMS}"
                )));
            }

            if *max_concurrency == 0 || *max_concurrency > FAN_OUT_MAX_CONCURRENCY {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' max_concurrency must be 1..={FAN_OUT_MAX_CONCURRENCY}"
                )));
            }

            if template.id.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "workflow step '{step_id}' fan-out template id must not be empty"
                )));
            }

            validate_step_kind(template.id.as_str(), &template.kind, false)
        }
    }
}
