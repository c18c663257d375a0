//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod env_secret_resolver;
mod http_job_runtime;
mod http_service_invoker;
mod in_memory_service_registry;
mod in_process_event_bus;
mod in_process_scaling_channel;
mod inline_job_queue;
mod postgres_audit_log_repository;
mod postgres_claim_store;
mod postgres_event_store;
mod postgres_scaling_store;
mod postgres_scheduler_state_store;
mod postgres_schema_store;
mod postgres_trigger_store;
mod postgres_workflow_store;
mod queue_manager;
mod redis_event_bus;
mod redis_job_queue;
mod redis_scaling_channel;

pub use env_secret_resolver::EnvSecretResolver;
pub use http_job_runtime::HttpJobRuntime;
pub use http_service_invoker::HttpServiceInvoker;
pub use in_memory_service_registry::InMemoryServiceRegistry;
pub use in_process_event_bus::InProcessEventBus;
pub use in_process_scaling_channel::InProcessScalingChannel;
pub use inline_job_queue::{InlineJobQueue, JobHandler};
pub use postgres_audit_log_repository::PostgresAuditLogRepository;
pub use postgres_claim_store::PostgresClaimStore;
pub use postgres_event_store::PostgresEventStore;
pub use postgres_scaling_store::PostgresScalingStore;
pub use postgres_scheduler_state_store::PostgresSchedulerStateStore;
pub use postgres_schema_store::PostgresSchemaStore;
pub use postgres_trigger_store::PostgresTriggerStore;
pub use postgres_workflow_store::PostgresWorkflowStore;
pub use queue_manager::{QueueManager, QueueMode};
pub use redis_event_bus::RedisEventBus;
pub use redis_job_queue::RedisJobQueue;
pub use redis_scaling_channel::RedisScalingChannel;
