//! AppHub orchestration worker runtime.
//!
//! Runs the queue consumers for event ingress, trigger evaluation, and
//! workflow execution, the runtime-scaling agents, and the asset
//! materializer task.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use apphub_application::{
    AssetMaterializer, AuditRepository, ConcurrencyHandle, EventBus, EventIngressService,
    EventSchemaRegistry, IngressConfig, JOB_EVENT_INGEST, JOB_EVENT_INGRESS_RETRY,
    JOB_TRIGGER_EVALUATE, JOB_TRIGGER_RETRY, JOB_WORKFLOW_RETRY, JOB_WORKFLOW_RUN, JobQueue,
    MaterializerConfig, QueueJob, QueueKey, RunClaimService, RuntimeScalingService, ScalingAgent,
    ScalingChannel, ScalingTargetConfig, TriggerEvaluator, TriggerEvaluatorConfig,
    WorkflowService, WorkflowServiceDeps,
};
use apphub_core::{AppError, AppResult, Clock, RunId, SystemClock};
use apphub_domain::BackoffConfig;
use apphub_infrastructure::{
    EnvSecretResolver, HttpJobRuntime, HttpServiceInvoker, InMemoryServiceRegistry,
    InProcessEventBus, InProcessScalingChannel, InlineJobQueue, JobHandler,
    PostgresAuditLogRepository, PostgresClaimStore, PostgresEventStore, PostgresScalingStore,
    PostgresSchedulerStateStore, PostgresSchemaStore, PostgresTriggerStore,
    PostgresWorkflowStore, QueueManager, QueueMode, RedisEventBus, RedisScalingChannel,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    redis_url: Option<String>,
    worker_id: String,
    job_runtime_url: String,
    job_runtime_secret: Option<String>,
    service_registry_json: Option<String>,
    schema_enforce: bool,
    poll_timeout_seconds: f64,
    ingress: IngressConfig,
    trigger: TriggerEvaluatorConfig,
    materializer: MaterializerConfig,
    scaling_targets: HashMap<QueueKey, ScalingTargetConfig>,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue_manager = QueueManager::new(InlineJobQueue::new());
    let queue: Arc<dyn JobQueue> = Arc::new(queue_manager.clone());

    let bus = build_event_bus(&config)?;
    let scaling_channel = build_scaling_channel(&config)?;

    let workflow_store = Arc::new(PostgresWorkflowStore::new(pool.clone()));
    let trigger_store = Arc::new(PostgresTriggerStore::new(pool.clone()));
    let event_store = Arc::new(PostgresEventStore::new(pool.clone()));
    let schema_store = Arc::new(PostgresSchemaStore::new(pool.clone()));
    let scheduler_store = Arc::new(PostgresSchedulerStateStore::new(pool.clone()));
    let scaling_store = Arc::new(PostgresScalingStore::new(pool.clone()));
    let claim_store = Arc::new(PostgresClaimStore::new(pool.clone()));
    let audit: Arc<dyn AuditRepository> = Arc::new(PostgresAuditLogRepository::new(pool));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;

    let service_registry = match config.service_registry_json.as_deref() {
        Some(document) => Arc::new(InMemoryServiceRegistry::from_json(document)?),
        None => Arc::new(InMemoryServiceRegistry::new()),
    };

    let workflows = WorkflowService::new(WorkflowServiceDeps {
        store: workflow_store.clone(),
        triggers: trigger_store.clone(),
        job_runtime: Arc::new(HttpJobRuntime::new(
            http_client.clone(),
            config.job_runtime_url.clone(),
            config.job_runtime_secret.clone(),
        )),
        services: service_registry,
        invoker: Arc::new(HttpServiceInvoker::new(http_client)),
        secrets: Arc::new(EnvSecretResolver::new()),
        queue: queue.clone(),
        bus: bus.clone(),
        audit: audit.clone(),
        clock: clock.clone(),
    });

    let schemas = Arc::new(EventSchemaRegistry::new(
        schema_store,
        clock.clone(),
        config.schema_enforce,
    ));

    let ingress = EventIngressService::new(
        schemas,
        event_store.clone(),
        scheduler_store.clone(),
        queue.clone(),
        audit.clone(),
        clock.clone(),
        config.ingress.clone(),
    );

    let evaluator = TriggerEvaluator::new(
        trigger_store,
        event_store,
        scheduler_store,
        workflows.clone(),
        queue.clone(),
        audit.clone(),
        clock.clone(),
        config.trigger.clone(),
    );

    let claims = RunClaimService::new(claim_store, clock.clone());
    let materializer = AssetMaterializer::new(
        workflow_store,
        claims,
        workflows.clone(),
        clock.clone(),
        config.materializer.clone(),
    );

    let scaling = RuntimeScalingService::new(
        scaling_store,
        scaling_channel.clone(),
        audit,
        clock,
        config.scaling_targets.clone(),
    )?;

    let dispatcher = Arc::new(JobDispatcher {
        ingress,
        evaluator,
        workflows,
    });

    register_inline_handlers(&queue_manager, dispatcher.clone()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(materializer.run(bus.subscribe(), shutdown_rx));

    info!(
        worker_id = %config.worker_id,
        queue_mode = ?QueueManager::mode(),
        schema_enforce = config.schema_enforce,
        "apphub-worker started"
    );

    match QueueManager::mode() {
        QueueMode::Inline => {
            // Inline mode has no consumers: producers execute job bodies in
            // their own call path. Keep the process alive for the
            // materializer and scaling agents.
            run_scaling_agents(&config, &scaling, &scaling_channel, HashMap::new());
            wait_for_shutdown().await;
        }
        QueueMode::Distributed => {
            let mut gates = HashMap::new();
            for key in [QueueKey::Event, QueueKey::EventTrigger, QueueKey::Workflow] {
                let gate =
                    spawn_queue_consumers(&config, &queue_manager, dispatcher.clone(), key);
                gates.insert(key, gate);
            }

            run_scaling_agents(&config, &scaling, &scaling_channel, gates);
            wait_for_shutdown().await;
        }
    }

    let _ = shutdown_tx.send(true);
    info!(worker_id = %config.worker_id, "apphub-worker stopping");
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
    }
}

/// Routes queue jobs to the owning service.
struct JobDispatcher {
    ingress: EventIngressService,
    evaluator: TriggerEvaluator,
    workflows: WorkflowService,
}

impl JobDispatcher {
    async fn dispatch(&self, job: QueueJob) -> AppResult<()> {
        match job.name.as_str() {
            JOB_EVENT_INGEST => {
                let input = serde_json::from_value(job.payload).map_err(|error| {
                    AppError::Validation(format!("invalid event-ingest payload: {error}"))
                })?;
                self.ingress.ingest(input).await.map(|_| ())
            }
            JOB_EVENT_INGRESS_RETRY => {
                let event_id = payload_str(&job.payload, "eventId")?;
                self.ingress.process_retry(event_id.as_str()).await.map(|_| ())
            }
            JOB_TRIGGER_EVALUATE => {
                let event_id = payload_str(&job.payload, "eventId")?;
                self.evaluator.evaluate_event(event_id.as_str()).await.map(|_| ())
            }
            JOB_TRIGGER_RETRY => {
                let event_id = payload_str(&job.payload, "eventId")?;
                let trigger_id = payload_str(&job.payload, "triggerId")?;
                let trigger_id = uuid::Uuid::parse_str(trigger_id.as_str()).map_err(|error| {
                    AppError::Validation(format!("invalid triggerId '{trigger_id}': {error}"))
                })?;
                let attempts = job
                    .payload
                    .get("attempts")
                    .and_then(Value::as_u64)
                    .and_then(|value| u32::try_from(value).ok())
                    .unwrap_or(1);

                self.evaluator
                    .evaluate_trigger_retry(event_id.as_str(), trigger_id, attempts)
                    .await
                    .map(|_| ())
            }
            JOB_WORKFLOW_RUN | JOB_WORKFLOW_RETRY => {
                let run_id = payload_str(&job.payload, "runId")?;
                let run_id = RunId::parse(run_id.as_str())?;
                self.workflows.execute_run(run_id).await.map(|_| ())
            }
            other => Err(AppError::Validation(format!("unknown queue job '{other}'"))),
        }
    }
}

fn payload_str(payload: &Value, field: &str) -> AppResult<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            AppError::Validation(format!("queue job payload requires string field '{field}'"))
        })
}

struct DispatchingHandler {
    dispatcher: Arc<JobDispatcher>,
}

#[async_trait]
impl JobHandler for DispatchingHandler {
    async fn handle(&self, job: QueueJob) -> AppResult<()> {
        self.dispatcher.dispatch(job).await
    }
}

async fn register_inline_handlers(queue_manager: &QueueManager, dispatcher: Arc<JobDispatcher>) {
    for key in [QueueKey::Event, QueueKey::EventTrigger, QueueKey::Workflow] {
        queue_manager
            .inline()
            .register_handler(
                key,
                Arc::new(DispatchingHandler {
                    dispatcher: dispatcher.clone(),
                }),
            )
            .await;
    }
}

/// Concurrency gate shared by the consumer tasks of one queue.
///
/// Consumer slots poll only while their index sits below the desired
/// concurrency; `0` pauses every slot but keeps the worker registered.
#[derive(Clone)]
struct ConsumerGate {
    desired: watch::Sender<i32>,
}

#[async_trait]
impl ConcurrencyHandle for ConsumerGate {
    async fn apply(&self, concurrency: i32) -> AppResult<()> {
        self.desired
            .send(concurrency)
            .map_err(|_| AppError::Internal("consumer gate closed".to_owned()))
    }
}

fn spawn_queue_consumers(
    config: &WorkerConfig,
    queue_manager: &QueueManager,
    dispatcher: Arc<JobDispatcher>,
    key: QueueKey,
) -> ConsumerGate {
    let target = config
        .scaling_targets
        .get(&key)
        .copied()
        .unwrap_or(ScalingTargetConfig {
            min_concurrency: 0,
            max_concurrency: 8,
            default_concurrency: 2,
            rate_limit_ms: 10_000,
        });

    let (desired_tx, desired_rx) = watch::channel(target.default_concurrency);
    let poll_timeout = config.poll_timeout_seconds;

    for slot in 0..target.max_concurrency.max(1) {
        let queue_manager = queue_manager.clone();
        let dispatcher = dispatcher.clone();
        let mut desired = desired_rx.clone();

        tokio::spawn(async move {
            loop {
                if *desired.borrow() <= slot {
                    // Parked until the policy raises concurrency again.
                    if desired.changed().await.is_err() {
                        return;
                    }
                    continue;
                }

                let distributed = match queue_manager.try_get_distributed().await {
                    Ok(Some(distributed)) => distributed,
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    Err(error) => {
                        warn!(queue = %key, error = %error, "queue unavailable; backing off");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                };

                match distributed.pop(key, poll_timeout).await {
                    Ok(Some(job)) => {
                        let job_name = job.name.clone();
                        if let Err(error) = dispatcher.dispatch(job).await {
                            warn!(
                                queue = %key,
                                job = %job_name,
                                error = %error,
                                "queue job failed"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(queue = %key, error = %error, "queue pop failed; backing off");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    ConsumerGate { desired: desired_tx }
}

fn run_scaling_agents(
    config: &WorkerConfig,
    scaling: &RuntimeScalingService,
    channel: &Arc<dyn ScalingChannel>,
    gates: HashMap<QueueKey, ConsumerGate>,
) {
    for (key, gate) in gates {
        let agent = ScalingAgent::new(
            scaling.clone(),
            key,
            format!("{}:{}", config.worker_id, key),
            Arc::new(gate),
        );
        tokio::spawn(agent.run(channel.subscribe()));
    }
}

fn build_event_bus(config: &WorkerConfig) -> AppResult<Arc<dyn EventBus>> {
    if QueueManager::mode() == QueueMode::Distributed
        && let Some(redis_url) = config.redis_url.as_deref()
    {
        let client = redis::Client::open(redis_url)
            .map_err(|error| AppError::Validation(format!("invalid REDIS_URL: {error}")))?;
        return Ok(Arc::new(RedisEventBus::new(client, "apphub:core-events")));
    }

    Ok(Arc::new(InProcessEventBus::default()))
}

fn build_scaling_channel(config: &WorkerConfig) -> AppResult<Arc<dyn ScalingChannel>> {
    if QueueManager::mode() == QueueMode::Distributed
        && let Some(redis_url) = config.redis_url.as_deref()
    {
        let client = redis::Client::open(redis_url)
            .map_err(|error| AppError::Validation(format!("invalid REDIS_URL: {error}")))?;
        return Ok(Arc::new(RedisScalingChannel::new(
            client,
            "apphub:runtime-scaling",
        )));
    }

    Ok(Arc::new(InProcessScalingChannel::new()))
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let redis_url = env::var("REDIS_URL")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("inline"));
        let worker_id = env::var("WORKER_ID")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));
        let job_runtime_url = env::var("APPHUB_JOB_RUNTIME_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3100".to_owned())
            .trim_end_matches('/')
            .to_owned();
        let job_runtime_secret = env::var("APPHUB_JOB_RUNTIME_SECRET")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let service_registry_json = env::var("APPHUB_SERVICE_REGISTRY").ok();
        let schema_enforce = parse_env_bool("APPHUB_EVENT_SCHEMA_ENFORCE", false)?;
        let poll_timeout_seconds = parse_env_f64("WORKER_POLL_TIMEOUT_SECONDS", 2.0)?;

        let ingress = IngressConfig {
            rate_limits: parse_rate_limits()?,
            retry_backoff: BackoffConfig {
                base_ms: parse_env_u64("EVENT_RETRY_BASE_MS", 5_000)?,
                factor: parse_env_f64("EVENT_RETRY_FACTOR", 2.0)?,
                max_ms: parse_env_u64("EVENT_RETRY_MAX_MS", 300_000)?,
                jitter_ratio: parse_env_f64("EVENT_RETRY_JITTER_RATIO", 0.2)?,
            },
            max_attempts: parse_env_u32("INGEST_JOB_ATTEMPTS", 10)?,
        };
        ingress.retry_backoff.validate()?;

        let trigger = TriggerEvaluatorConfig {
            error_threshold: parse_env_i64("EVENT_TRIGGER_ERROR_THRESHOLD", 5)?,
            error_window_ms: parse_env_i64("EVENT_TRIGGER_WINDOW_MS", 60_000)?,
            trigger_pause_ms: parse_env_i64("EVENT_TRIGGER_PAUSE_MS", 300_000)?,
            retry_attempts: parse_env_u32("EVENT_TRIGGER_ATTEMPTS", 5)?,
            retry_backoff: BackoffConfig {
                base_ms: parse_env_u64("EVENT_TRIGGER_BACKOFF_MS", 5_000)?,
                factor: 2.0,
                max_ms: parse_env_u64("EVENT_RETRY_MAX_MS", 300_000)?,
                jitter_ratio: parse_env_f64("EVENT_RETRY_JITTER_RATIO", 0.2)?,
            },
        };
        trigger.retry_backoff.validate()?;

        let materializer = MaterializerConfig {
            instance_id: format!("{worker_id}:materializer"),
            base_backoff_ms: parse_env_i64("ASSET_MATERIALIZER_BASE_BACKOFF_MS", 10_000)?,
            max_backoff_ms: parse_env_i64("ASSET_MATERIALIZER_MAX_BACKOFF_MS", 600_000)?,
            refresh_interval_ms: parse_env_i64("ASSET_MATERIALIZER_REFRESH_INTERVAL_MS", 300_000)?,
        };

        let mut scaling_targets = HashMap::new();
        for key in QueueKey::all() {
            let prefix = key.as_str().to_uppercase();
            scaling_targets.insert(
                key,
                ScalingTargetConfig {
                    min_concurrency: 0,
                    max_concurrency: parse_env_i32(
                        format!("{prefix}_MAX_CONCURRENCY").as_str(),
                        8,
                    )?,
                    default_concurrency: parse_env_i32(
                        format!("{prefix}_DEFAULT_CONCURRENCY").as_str(),
                        2,
                    )?,
                    rate_limit_ms: parse_env_i64(
                        format!("{prefix}_SCALING_RATE_LIMIT_MS").as_str(),
                        10_000,
                    )?,
                },
            );
        }

        Ok(Self {
            database_url,
            redis_url,
            worker_id,
            job_runtime_url,
            job_runtime_secret,
            service_registry_json,
            schema_enforce,
            poll_timeout_seconds,
            ingress,
            trigger,
            materializer,
            scaling_targets,
        })
    }
}

fn parse_rate_limits() -> AppResult<Vec<apphub_application::SourceRateLimit>> {
    match env::var("EVENT_SOURCE_RATE_LIMITS") {
        Ok(value) if !value.trim().is_empty() => {
            serde_json::from_str(value.as_str()).map_err(|error| {
                AppError::Validation(format!("invalid EVENT_SOURCE_RATE_LIMITS value: {error}"))
            })
        }
        _ => Ok(Vec::new()),
    }
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn parse_env_bool(name: &str, default: bool) -> AppResult<bool> {
    match env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(AppError::Validation(format!(
                "invalid {name} value '{other}'"
            ))),
        },
        Err(_) => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> AppResult<u32> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_i32(name: &str, default: i32) -> AppResult<i32> {
    match env::var(name) {
        Ok(value) => value.parse::<i32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_i64(name: &str, default: i64) -> AppResult<i64> {
    match env::var(name) {
        Ok(value) => value.parse::<i64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_f64(name: &str, default: f64) -> AppResult<f64> {
    match env::var(name) {
        Ok(value) => value.parse::<f64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
