//! Ports and record types for workflow orchestration.

mod claims;
mod execution;
mod job_runtime;
mod repository;
mod service_invoker;

pub use claims::{AutoRunClaim, AutoRunClaimStore, ClaimRelease};
pub use execution::{
    AssetMaterialization, AutoRunFailureState, CompleteWorkflowRunInput, CreateRunOutcome,
    CreateWorkflowRunInput, StalePartitionFlag, WorkflowRun, WorkflowRunListQuery,
    WorkflowRunStatus, WorkflowRunStepAsset, WorkflowRunTrigger, WorkflowStepRun,
    WorkflowStepStatus,
};
pub use job_runtime::{JobRunOutcome, JobRunRequest, JobRunStatus, JobRuntime};
pub use repository::WorkflowStore;
pub use service_invoker::{
    RegisteredService, SecretResolver, ServiceHealth, ServiceInvocation, ServiceInvoker,
    ServiceRegistry, ServiceResponse,
};
