//! Workflow orchestration: definition lifecycle, run creation under run-key
//! uniqueness, and DAG execution.

use std::sync::Arc;

use apphub_core::Clock;

use crate::audit_ports::AuditRepository;
use crate::event_bus::EventBus;
use crate::event_ports::TriggerStore;
use crate::queue_ports::JobQueue;
use crate::workflow_ports::{
    JobRuntime, SecretResolver, ServiceInvoker, ServiceRegistry, WorkflowStore,
};

mod assets;
mod definitions;
mod execution;
mod runs;
mod steps;

pub use execution::ExecutionOutcome;

/// Default cap on steps of one workflow run executing at once.
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 4;

/// Orchestration service for workflow definitions and runs.
#[derive(Clone)]
pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    triggers: Arc<dyn TriggerStore>,
    job_runtime: Arc<dyn JobRuntime>,
    services: Arc<dyn ServiceRegistry>,
    invoker: Arc<dyn ServiceInvoker>,
    secrets: Arc<dyn SecretResolver>,
    queue: Arc<dyn JobQueue>,
    bus: Arc<dyn EventBus>,
    audit: Arc<dyn AuditRepository>,
    clock: Arc<dyn Clock>,
    max_parallel_steps: usize,
}

/// Collaborators wired into a [`WorkflowService`].
pub struct WorkflowServiceDeps {
    /// Workflow store.
    pub store: Arc<dyn WorkflowStore>,
    /// Trigger store.
    pub triggers: Arc<dyn TriggerStore>,
    /// Job runtime collaborator.
    pub job_runtime: Arc<dyn JobRuntime>,
    /// Service registry collaborator.
    pub services: Arc<dyn ServiceRegistry>,
    /// HTTP invoker for service steps.
    pub invoker: Arc<dyn ServiceInvoker>,
    /// Secret resolver for service step headers.
    pub secrets: Arc<dyn SecretResolver>,
    /// Job queue.
    pub queue: Arc<dyn JobQueue>,
    /// Internal event bus.
    pub bus: Arc<dyn EventBus>,
    /// Audit log.
    pub audit: Arc<dyn AuditRepository>,
    /// Clock.
    pub clock: Arc<dyn Clock>,
}

impl WorkflowService {
    /// Creates a workflow service.
    #[must_use]
    pub fn new(deps: WorkflowServiceDeps) -> Self {
        Self {
            store: deps.store,
            triggers: deps.triggers,
            job_runtime: deps.job_runtime,
            services: deps.services,
            invoker: deps.invoker,
            secrets: deps.secrets,
            queue: deps.queue,
            bus: deps.bus,
            audit: deps.audit,
            clock: deps.clock,
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
        }
    }

    /// Overrides the per-run parallel step cap.
    #[must_use]
    pub fn with_max_parallel_steps(mut self, max_parallel_steps: usize) -> Self {
        self.max_parallel_steps = max_parallel_steps.max(1);
        self
    }
}
