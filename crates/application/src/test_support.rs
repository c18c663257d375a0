//! In-memory fakes shared by service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use apphub_core::run_key::normalize_run_key;
use apphub_core::{AppError, AppResult, RunId, WorkflowId};
use apphub_domain::{EventEnvelope, EventTrigger, WorkflowDefinition};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::audit_ports::{AuditEvent, AuditRepository};
use crate::event_bus::{CoreEvent, EventBus};
use crate::event_ports::{EventStore, IngressRetry, TriggerStore};
use crate::queue_ports::{EnqueueDisposition, JobQueue, QueueCounts, QueueJob, QueueKey};
use crate::scheduler_ports::{
    RateLimitDecision, SchedulerStateStore, SourceMetrics, SourceMetricsUpdate, SourcePauseState,
    SourceRateLimit, TriggerFailureDecision, TriggerMetricKind, TriggerMetrics,
    TriggerPauseState,
};
use crate::workflow_ports::{
    AssetMaterialization, AutoRunClaim, AutoRunClaimStore, AutoRunFailureState, ClaimRelease,
    CompleteWorkflowRunInput, CreateRunOutcome, CreateWorkflowRunInput, JobRunOutcome,
    JobRunRequest, JobRunStatus, JobRuntime, RegisteredService, SecretResolver, ServiceInvocation,
    ServiceInvoker, ServiceRegistry, ServiceResponse, StalePartitionFlag, WorkflowRun,
    WorkflowRunListQuery, WorkflowRunStatus, WorkflowRunStepAsset, WorkflowStepRun,
    WorkflowStore,
};

/// In-memory event schema store.
#[derive(Default)]
pub struct FakeSchemaStore {
    /// Registered schemas keyed by `(event_type, version)`.
    pub schemas: Mutex<HashMap<(String, i32), apphub_domain::EventSchema>>,
}

#[async_trait]
impl crate::event_ports::EventSchemaStore for FakeSchemaStore {
    async fn insert_schema(&self, schema: &apphub_domain::EventSchema) -> AppResult<()> {
        let mut schemas = self.schemas.lock().await;
        let key = (schema.event_type.clone(), schema.version);
        if schemas.contains_key(&key) {
            return Err(AppError::Conflict(format!(
                "schema '{}' version {} exists",
                schema.event_type, schema.version
            )));
        }

        schemas.insert(key, schema.clone());
        Ok(())
    }

    async fn find_schema(
        &self,
        event_type: &str,
        version: i32,
    ) -> AppResult<Option<apphub_domain::EventSchema>> {
        Ok(self
            .schemas
            .lock()
            .await
            .get(&(event_type.to_owned(), version))
            .cloned())
    }

    async fn latest_schema(
        &self,
        event_type: &str,
        statuses: &[apphub_domain::EventSchemaStatus],
    ) -> AppResult<Option<apphub_domain::EventSchema>> {
        Ok(self
            .schemas
            .lock()
            .await
            .values()
            .filter(|schema| schema.event_type == event_type && statuses.contains(&schema.status))
            .max_by_key(|schema| schema.version)
            .cloned())
    }

    async fn max_version(&self, event_type: &str) -> AppResult<Option<i32>> {
        Ok(self
            .schemas
            .lock()
            .await
            .values()
            .filter(|schema| schema.event_type == event_type)
            .map(|schema| schema.version)
            .max())
    }

    async fn update_status(
        &self,
        event_type: &str,
        version: i32,
        status: apphub_domain::EventSchemaStatus,
    ) -> AppResult<()> {
        let mut schemas = self.schemas.lock().await;
        let Some(schema) = schemas.get_mut(&(event_type.to_owned(), version)) else {
            return Err(AppError::NotFound(format!(
                "schema '{event_type}' version {version} not found"
            )));
        };

        schema.status = status;
        Ok(())
    }
}

/// Recording audit repository.
#[derive(Default)]
pub struct FakeAuditRepository {
    /// Appended events in order.
    pub events: Mutex<Vec<AuditEvent>>,
}

#[async_trait]
impl AuditRepository for FakeAuditRepository {
    async fn append_event(&self, event: AuditEvent) -> AppResult<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Recording queue with job-id deduplication and failure injection.
#[derive(Default)]
pub struct FakeQueue {
    /// Every accepted job in submission order.
    pub jobs: Mutex<Vec<(QueueKey, QueueJob)>>,
    /// Errors handed out on upcoming enqueues, front first.
    pub enqueue_errors: Mutex<VecDeque<AppError>>,
}

impl FakeQueue {
    /// Returns accepted jobs for one queue.
    pub async fn jobs_for(&self, key: QueueKey) -> Vec<QueueJob> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|(job_key, _)| *job_key == key)
            .map(|(_, job)| job.clone())
            .collect()
    }

    /// Queues an error for the next enqueue call.
    pub async fn fail_next_enqueue(&self, error: AppError) {
        self.enqueue_errors.lock().await.push_back(error);
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn enqueue(&self, key: QueueKey, job: QueueJob) -> AppResult<EnqueueDisposition> {
        if let Some(error) = self.enqueue_errors.lock().await.pop_front() {
            return Err(error);
        }

        let mut jobs = self.jobs.lock().await;
        if let Some(job_id) = &job.job_id
            && jobs
                .iter()
                .any(|(existing_key, existing)| {
                    *existing_key == key && existing.job_id.as_ref() == Some(job_id)
                })
        {
            return Ok(EnqueueDisposition::Duplicate);
        }

        jobs.push((key, job));
        Ok(EnqueueDisposition::Enqueued)
    }

    async fn remove_job(&self, key: QueueKey, job_id: &str) -> AppResult<bool> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|(existing_key, existing)| {
            !(*existing_key == key && existing.job_id.as_deref() == Some(job_id))
        });
        Ok(jobs.len() != before)
    }

    async fn counts(&self, key: QueueKey) -> AppResult<QueueCounts> {
        let jobs = self.jobs.lock().await;
        let waiting = jobs
            .iter()
            .filter(|(job_key, job)| *job_key == key && job.run_at.is_none())
            .count();
        let delayed = jobs
            .iter()
            .filter(|(job_key, job)| *job_key == key && job.run_at.is_some())
            .count();

        Ok(QueueCounts {
            waiting: waiting as i64,
            delayed: delayed as i64,
            ..QueueCounts::default()
        })
    }
}

/// In-memory envelope and retry store.
#[derive(Default)]
pub struct FakeEventStore {
    /// Persisted envelopes by id.
    pub envelopes: Mutex<HashMap<String, EventEnvelope>>,
    /// Retry rows by event id.
    pub retries: Mutex<HashMap<String, IngressRetry>>,
}

#[async_trait]
impl EventStore for FakeEventStore {
    async fn insert_envelope(&self, envelope: &EventEnvelope) -> AppResult<bool> {
        let mut envelopes = self.envelopes.lock().await;
        let inserted = !envelopes.contains_key(&envelope.id);
        envelopes.insert(envelope.id.clone(), envelope.clone());
        Ok(inserted)
    }

    async fn find_envelope(&self, event_id: &str) -> AppResult<Option<EventEnvelope>> {
        Ok(self.envelopes.lock().await.get(event_id).cloned())
    }

    async fn upsert_ingress_retry(&self, retry: &IngressRetry) -> AppResult<()> {
        self.retries
            .lock()
            .await
            .insert(retry.event_id.clone(), retry.clone());
        Ok(())
    }

    async fn find_ingress_retry(&self, event_id: &str) -> AppResult<Option<IngressRetry>> {
        Ok(self.retries.lock().await.get(event_id).cloned())
    }

    async fn delete_ingress_retry(&self, event_id: &str) -> AppResult<()> {
        self.retries.lock().await.remove(event_id);
        Ok(())
    }

    async fn cancel_ingress_retry(&self, event_id: &str) -> AppResult<bool> {
        let mut retries = self.retries.lock().await;
        let Some(retry) = retries.get_mut(event_id) else {
            return Ok(false);
        };

        retry.cancelled = true;
        Ok(true)
    }
}

#[derive(Default)]
struct WindowCounter {
    window_start: Option<DateTime<Utc>>,
    count: i64,
}

/// In-memory scheduler state with windowed counters.
#[derive(Default)]
pub struct FakeSchedulerStore {
    pauses: Mutex<HashMap<String, SourcePauseState>>,
    source_windows: Mutex<HashMap<String, WindowCounter>>,
    trigger_pauses: Mutex<HashMap<Uuid, TriggerPauseState>>,
    trigger_failures: Mutex<HashMap<Uuid, WindowCounter>>,
    trigger_launches: Mutex<HashMap<Uuid, WindowCounter>>,
    /// Aggregate per-source counters.
    pub source_metrics: Mutex<HashMap<String, SourceMetrics>>,
    /// Aggregate per-trigger counters.
    pub trigger_metrics: Mutex<HashMap<Uuid, TriggerMetrics>>,
}

#[async_trait]
impl SchedulerStateStore for FakeSchedulerStore {
    async fn find_source_pause(
        &self,
        source: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<SourcePauseState>> {
        Ok(self
            .pauses
            .lock()
            .await
            .get(source)
            .filter(|pause| pause.until > now)
            .cloned())
    }

    async fn pause_source(&self, state: SourcePauseState) -> AppResult<()> {
        self.pauses.lock().await.insert(state.source.clone(), state);
        Ok(())
    }

    async fn resume_source(&self, source: &str) -> AppResult<()> {
        self.pauses.lock().await.remove(source);
        Ok(())
    }

    async fn record_source_event(
        &self,
        limit: &SourceRateLimit,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitDecision> {
        let mut windows = self.source_windows.lock().await;
        let counter = windows.entry(limit.source.clone()).or_default();

        let expired = counter
            .window_start
            .is_none_or(|start| now - start > Duration::milliseconds(limit.interval_ms));
        if expired {
            counter.window_start = Some(now);
            counter.count = 0;
        }

        counter.count += 1;
        if counter.count > limit.limit {
            let until = now + Duration::milliseconds(limit.pause_ms);
            let reason = "rate_limit_exceeded".to_owned();
            self.pauses.lock().await.insert(
                limit.source.clone(),
                SourcePauseState {
                    source: limit.source.clone(),
                    until,
                    reason: reason.clone(),
                    manual: false,
                    details: None,
                },
            );
            return Ok(RateLimitDecision::Paused { until, reason });
        }

        Ok(RateLimitDecision::Allowed)
    }

    async fn find_trigger_pause(
        &self,
        trigger_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<TriggerPauseState>> {
        Ok(self
            .trigger_pauses
            .lock()
            .await
            .get(&trigger_id)
            .filter(|pause| pause.until > now)
            .cloned())
    }

    async fn record_trigger_failure(
        &self,
        trigger_id: Uuid,
        window_ms: i64,
        threshold: i64,
        pause_ms: i64,
        now: DateTime<Utc>,
    ) -> AppResult<TriggerFailureDecision> {
        let mut failures = self.trigger_failures.lock().await;
        let counter = failures.entry(trigger_id).or_default();

        let expired = counter
            .window_start
            .is_none_or(|start| now - start > Duration::milliseconds(window_ms));
        if expired {
            counter.window_start = Some(now);
            counter.count = 0;
        }

        counter.count += 1;
        let paused_until = if counter.count >= threshold {
            let until = now + Duration::milliseconds(pause_ms);
            self.trigger_pauses.lock().await.insert(
                trigger_id,
                TriggerPauseState {
                    trigger_id,
                    until,
                    reason: "error_threshold_exceeded".to_owned(),
                },
            );
            Some(until)
        } else {
            None
        };

        Ok(TriggerFailureDecision {
            failures: counter.count,
            paused_until,
        })
    }

    async fn clear_trigger_failures(&self, trigger_id: Uuid) -> AppResult<()> {
        self.trigger_failures.lock().await.remove(&trigger_id);
        Ok(())
    }

    async fn record_trigger_launch(
        &self,
        trigger_id: Uuid,
        window_ms: i64,
        max_count: i64,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut launches = self.trigger_launches.lock().await;
        let counter = launches.entry(trigger_id).or_default();

        let expired = counter
            .window_start
            .is_none_or(|start| now - start > Duration::milliseconds(window_ms));
        if expired {
            counter.window_start = Some(now);
            counter.count = 0;
        }

        counter.count += 1;
        Ok(counter.count <= max_count)
    }

    async fn record_source_metrics(
        &self,
        source: &str,
        update: SourceMetricsUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut metrics = self.source_metrics.lock().await;
        let entry = metrics.entry(source.to_owned()).or_insert_with(|| SourceMetrics {
            source: source.to_owned(),
            total: 0,
            throttled: 0,
            dropped: 0,
            failures: 0,
            total_lag_ms: 0,
            last_lag_ms: 0,
            max_lag_ms: 0,
            last_event_at: None,
        });

        entry.total += 1;
        if update.throttled {
            entry.throttled += 1;
        }
        if update.dropped {
            entry.dropped += 1;
        }
        if update.failure {
            entry.failures += 1;
        }
        if let Some(lag_ms) = update.lag_ms {
            entry.total_lag_ms += lag_ms;
            entry.last_lag_ms = lag_ms;
            entry.max_lag_ms = entry.max_lag_ms.max(lag_ms);
        }
        entry.last_event_at = Some(now);
        Ok(())
    }

    async fn source_metrics(&self, source: &str) -> AppResult<Option<SourceMetrics>> {
        Ok(self.source_metrics.lock().await.get(source).cloned())
    }

    async fn record_trigger_metric(
        &self,
        trigger_id: Uuid,
        kind: TriggerMetricKind,
        error: Option<&str>,
    ) -> AppResult<()> {
        let mut metrics = self.trigger_metrics.lock().await;
        let entry = metrics.entry(trigger_id).or_default();

        match kind {
            TriggerMetricKind::Filtered => entry.filtered += 1,
            TriggerMetricKind::Matched => entry.matched += 1,
            TriggerMetricKind::Launched => entry.launched += 1,
            TriggerMetricKind::Throttled => entry.throttled += 1,
            TriggerMetricKind::Skipped => entry.skipped += 1,
            TriggerMetricKind::Failed => entry.failed += 1,
            TriggerMetricKind::Paused => entry.paused += 1,
        }

        entry.last_status = Some(kind.as_str().to_owned());
        entry.last_error = error.map(ToOwned::to_owned);
        Ok(())
    }

    async fn trigger_metrics(&self, trigger_id: Uuid) -> AppResult<Option<TriggerMetrics>> {
        Ok(self.trigger_metrics.lock().await.get(&trigger_id).cloned())
    }
}

/// In-memory trigger store.
#[derive(Default)]
pub struct FakeTriggerStore {
    /// Triggers by id.
    pub triggers: Mutex<HashMap<Uuid, EventTrigger>>,
}

#[async_trait]
impl TriggerStore for FakeTriggerStore {
    async fn list_triggers_for_event(&self, event_type: &str) -> AppResult<Vec<EventTrigger>> {
        let mut matching: Vec<EventTrigger> = self
            .triggers
            .lock()
            .await
            .values()
            .filter(|trigger| trigger.event_type == event_type)
            .cloned()
            .collect();
        matching.sort_by_key(|trigger| trigger.id);
        Ok(matching)
    }

    async fn find_trigger(&self, trigger_id: Uuid) -> AppResult<Option<EventTrigger>> {
        Ok(self.triggers.lock().await.get(&trigger_id).cloned())
    }

    async fn replace_workflow_triggers(
        &self,
        workflow_definition_id: WorkflowId,
        triggers: Vec<EventTrigger>,
    ) -> AppResult<()> {
        let mut stored = self.triggers.lock().await;
        stored.retain(|_, trigger| trigger.workflow_definition_id != workflow_definition_id);
        for trigger in triggers {
            stored.insert(trigger.id, trigger);
        }
        Ok(())
    }
}

/// In-memory workflow store honoring the run-key uniqueness index.
#[derive(Default)]
pub struct FakeWorkflowStore {
    /// Definition versions by workflow id.
    pub definitions: Mutex<HashMap<WorkflowId, Vec<WorkflowDefinition>>>,
    /// Runs by id.
    pub runs: Mutex<HashMap<RunId, WorkflowRun>>,
    /// Step runs by run id.
    pub step_runs: Mutex<HashMap<RunId, Vec<WorkflowStepRun>>>,
    /// Every recorded step asset.
    pub step_assets: Mutex<Vec<WorkflowRunStepAsset>>,
    /// Latest snapshot per `(workflow, asset, partition)`.
    pub latest: Mutex<HashMap<(WorkflowId, String, String), AssetMaterialization>>,
    /// Stale partition flags.
    pub stale_flags: Mutex<Vec<StalePartitionFlag>>,
    /// Auto-run failure backoff state.
    pub failure_states: Mutex<HashMap<WorkflowId, AutoRunFailureState>>,
}

#[async_trait]
impl WorkflowStore for FakeWorkflowStore {
    async fn insert_definition(&self, definition: &WorkflowDefinition) -> AppResult<()> {
        let mut definitions = self.definitions.lock().await;
        let versions = definitions.entry(definition.id()).or_default();
        if versions.iter().any(|existing| existing.version() == definition.version()) {
            return Err(AppError::Conflict(format!(
                "workflow '{}' version {} exists",
                definition.slug(),
                definition.version()
            )));
        }

        versions.push(definition.clone());
        Ok(())
    }

    async fn find_definition(&self, id: WorkflowId) -> AppResult<Option<WorkflowDefinition>> {
        Ok(self
            .definitions
            .lock()
            .await
            .get(&id)
            .and_then(|versions| versions.iter().max_by_key(|version| version.version()))
            .cloned())
    }

    async fn find_definition_by_slug(&self, slug: &str) -> AppResult<Option<WorkflowDefinition>> {
        Ok(self
            .definitions
            .lock()
            .await
            .values()
            .flatten()
            .filter(|definition| definition.slug() == slug)
            .max_by_key(|definition| definition.version())
            .cloned())
    }

    async fn list_definitions(&self) -> AppResult<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.lock().await;
        Ok(definitions
            .values()
            .filter_map(|versions| versions.iter().max_by_key(|version| version.version()))
            .cloned()
            .collect())
    }

    async fn create_run(&self, input: CreateWorkflowRunInput) -> AppResult<CreateRunOutcome> {
        let run_key_normalized = input
            .run_key
            .as_deref()
            .map(normalize_run_key)
            .filter(|normalized| !normalized.is_empty());

        let mut runs = self.runs.lock().await;
        if let Some(normalized) = &run_key_normalized
            && let Some(existing) = runs.values().find(|run| {
                run.workflow_definition_id == input.workflow_definition_id
                    && !run.status.is_terminal()
                    && run.run_key_normalized.as_ref() == Some(normalized)
            })
        {
            return Ok(CreateRunOutcome::Existing(existing.clone()));
        }

        let run = WorkflowRun {
            id: RunId::new(),
            workflow_definition_id: input.workflow_definition_id,
            status: WorkflowRunStatus::Pending,
            run_key: input.run_key,
            run_key_normalized,
            parameters: input.parameters,
            trigger: input.trigger,
            triggered_by: input.triggered_by,
            partition_key: input.partition_key,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            shared: Value::Object(serde_json::Map::new()),
        };

        runs.insert(run.id, run.clone());
        Ok(CreateRunOutcome::Created(run))
    }

    async fn find_run(&self, run_id: RunId) -> AppResult<Option<WorkflowRun>> {
        Ok(self.runs.lock().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, query: WorkflowRunListQuery) -> AppResult<Vec<WorkflowRun>> {
        let runs = self.runs.lock().await;
        let mut matching: Vec<WorkflowRun> = runs
            .values()
            .filter(|run| {
                query
                    .workflow_definition_id
                    .is_none_or(|id| run.workflow_definition_id == id)
                    && query.status.is_none_or(|status| run.status == status)
            })
            .cloned()
            .collect();
        matching.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(matching.into_iter().skip(query.offset).take(query.limit).collect())
    }

    async fn mark_run_running(&self, run_id: RunId, started_at: DateTime<Utc>) -> AppResult<()> {
        let mut runs = self.runs.lock().await;
        let Some(run) = runs.get_mut(&run_id) else {
            return Err(AppError::NotFound(format!("run '{run_id}' not found")));
        };

        if run.status == WorkflowRunStatus::Pending {
            run.status = WorkflowRunStatus::Running;
            run.started_at = Some(started_at);
        }
        Ok(())
    }

    async fn update_run_shared(&self, run_id: RunId, shared: &Value) -> AppResult<()> {
        let mut runs = self.runs.lock().await;
        let Some(run) = runs.get_mut(&run_id) else {
            return Err(AppError::NotFound(format!("run '{run_id}' not found")));
        };

        run.shared = shared.clone();
        Ok(())
    }

    async fn complete_run(&self, input: CompleteWorkflowRunInput) -> AppResult<WorkflowRun> {
        let mut runs = self.runs.lock().await;
        let Some(run) = runs.get_mut(&input.run_id) else {
            return Err(AppError::NotFound(format!("run '{}' not found", input.run_id)));
        };

        run.status = input.status;
        run.error_message = input.error_message;
        run.shared = input.shared;
        run.completed_at = Some(input.completed_at);
        Ok(run.clone())
    }

    async fn upsert_step_run(&self, run_id: RunId, step: &WorkflowStepRun) -> AppResult<()> {
        let mut step_runs = self.step_runs.lock().await;
        let steps = step_runs.entry(run_id).or_default();
        match steps.iter_mut().find(|existing| existing.step_id == step.step_id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn list_step_runs(&self, run_id: RunId) -> AppResult<Vec<WorkflowStepRun>> {
        Ok(self.step_runs.lock().await.get(&run_id).cloned().unwrap_or_default())
    }

    async fn record_step_asset(&self, asset: &WorkflowRunStepAsset) -> AppResult<()> {
        self.step_assets.lock().await.push(asset.clone());

        let mut latest = self.latest.lock().await;
        let key = (
            asset.workflow_definition_id,
            asset.asset_id_normalized.clone(),
            asset.partition_key_normalized.clone(),
        );
        let replace = latest
            .get(&key)
            .is_none_or(|existing| existing.produced_at <= asset.produced_at);
        if replace {
            latest.insert(
                key,
                AssetMaterialization {
                    workflow_definition_id: asset.workflow_definition_id,
                    workflow_slug: String::new(),
                    run_id: asset.run_id,
                    step_id: asset.step_id.clone(),
                    asset_id: asset.asset_id_normalized.clone(),
                    partition_key: asset.partition_key.clone(),
                    produced_at: asset.produced_at,
                },
            );
        }
        Ok(())
    }

    async fn list_step_assets(&self, run_id: RunId) -> AppResult<Vec<WorkflowRunStepAsset>> {
        Ok(self
            .step_assets
            .lock()
            .await
            .iter()
            .filter(|asset| asset.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn latest_materializations(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Vec<AssetMaterialization>> {
        Ok(self
            .latest
            .lock()
            .await
            .iter()
            .filter(|((workflow_id, _, _), _)| *workflow_id == workflow_definition_id)
            .map(|(_, materialization)| materialization.clone())
            .collect())
    }

    async fn find_latest_materialization(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id_normalized: &str,
        partition_key_normalized: &str,
    ) -> AppResult<Option<AssetMaterialization>> {
        Ok(self
            .latest
            .lock()
            .await
            .get(&(
                workflow_definition_id,
                asset_id_normalized.to_owned(),
                partition_key_normalized.to_owned(),
            ))
            .cloned())
    }

    async fn mark_partition_stale(&self, flag: &StalePartitionFlag) -> AppResult<()> {
        let mut flags = self.stale_flags.lock().await;
        flags.retain(|existing| {
            !(existing.workflow_definition_id == flag.workflow_definition_id
                && existing.asset_id == flag.asset_id
                && existing.partition_key == flag.partition_key)
        });
        flags.push(flag.clone());
        Ok(())
    }

    async fn clear_partition_stale(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id_normalized: &str,
        partition_key: Option<&str>,
    ) -> AppResult<()> {
        self.stale_flags.lock().await.retain(|existing| {
            !(existing.workflow_definition_id == workflow_definition_id
                && existing.asset_id == asset_id_normalized
                && existing.partition_key.as_deref() == partition_key)
        });
        Ok(())
    }

    async fn list_stale_partitions(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Vec<StalePartitionFlag>> {
        Ok(self
            .stale_flags
            .lock()
            .await
            .iter()
            .filter(|flag| flag.workflow_definition_id == workflow_definition_id)
            .cloned()
            .collect())
    }

    async fn find_auto_run_failure_state(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Option<AutoRunFailureState>> {
        Ok(self.failure_states.lock().await.get(&workflow_definition_id).copied())
    }

    async fn record_auto_run_failure(&self, state: AutoRunFailureState) -> AppResult<()> {
        self.failure_states
            .lock()
            .await
            .insert(state.workflow_definition_id, state);
        Ok(())
    }

    async fn clear_auto_run_failure(&self, workflow_definition_id: WorkflowId) -> AppResult<()> {
        self.failure_states.lock().await.remove(&workflow_definition_id);
        Ok(())
    }
}

/// In-memory claim store with at most one active claim per workflow.
#[derive(Default)]
pub struct FakeClaimStore {
    /// Active claims by workflow id.
    pub claims: Mutex<HashMap<WorkflowId, AutoRunClaim>>,
}

#[async_trait]
impl AutoRunClaimStore for FakeClaimStore {
    async fn try_claim(&self, claim: AutoRunClaim) -> AppResult<bool> {
        let mut claims = self.claims.lock().await;
        if claims.contains_key(&claim.workflow_definition_id) {
            return Ok(false);
        }

        claims.insert(claim.workflow_definition_id, claim);
        Ok(true)
    }

    async fn attach_run(
        &self,
        workflow_definition_id: WorkflowId,
        owner_id: &str,
        run_id: RunId,
    ) -> AppResult<bool> {
        let mut claims = self.claims.lock().await;
        let Some(claim) = claims.get_mut(&workflow_definition_id) else {
            return Ok(false);
        };

        if claim.owner_id != owner_id {
            return Ok(false);
        }

        claim.workflow_run_id = Some(run_id);
        Ok(true)
    }

    async fn release(
        &self,
        workflow_definition_id: WorkflowId,
        release: ClaimRelease,
    ) -> AppResult<()> {
        let mut claims = self.claims.lock().await;
        let matches = claims.get(&workflow_definition_id).is_some_and(|claim| match &release {
            ClaimRelease::Owner(owner_id) => claim.owner_id == *owner_id,
            ClaimRelease::Run(run_id) => claim.workflow_run_id == Some(*run_id),
        });

        if matches {
            claims.remove(&workflow_definition_id);
        }
        Ok(())
    }

    async fn find_claim(
        &self,
        workflow_definition_id: WorkflowId,
    ) -> AppResult<Option<AutoRunClaim>> {
        Ok(self.claims.lock().await.get(&workflow_definition_id).cloned())
    }

    async fn cleanup_expired(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let mut claims = self.claims.lock().await;
        let original = claims.len();
        claims.retain(|_, claim| claim.expires_at >= before);
        Ok((original - claims.len()) as u64)
    }
}

/// Scripted job runtime with concurrency accounting for fan-out tests.
pub struct FakeJobRuntime {
    /// Scripted outcomes by step id, popped front first.
    pub outcomes: Mutex<HashMap<String, VecDeque<AppResult<JobRunOutcome>>>>,
    /// Every dispatched request.
    pub requests: Mutex<Vec<JobRunRequest>>,
    /// Per-call artificial latency, to force overlap in concurrency tests.
    pub delay_ms: u64,
    current: AtomicI64,
    /// Highest observed simultaneous dispatch count.
    pub max_in_flight: AtomicI64,
}

impl Default for FakeJobRuntime {
    fn default() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            delay_ms: 0,
            current: AtomicI64::new(0),
            max_in_flight: AtomicI64::new(0),
        }
    }
}

impl FakeJobRuntime {
    /// Creates a runtime that sleeps per call, to force overlap.
    #[must_use]
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }

    /// Scripts the next outcome for one step id.
    pub async fn push_outcome(&self, step_id: &str, outcome: AppResult<JobRunOutcome>) {
        self.outcomes
            .lock()
            .await
            .entry(step_id.to_owned())
            .or_default()
            .push_back(outcome);
    }
}

#[async_trait]
impl JobRuntime for FakeJobRuntime {
    async fn run_job(&self, request: JobRunRequest) -> AppResult<JobRunOutcome> {
        let in_flight = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }

        self.requests.lock().await.push(request.clone());

        let scripted = self
            .outcomes
            .lock()
            .await
            .get_mut(request.step_id.as_str())
            .and_then(VecDeque::pop_front);

        self.current.fetch_sub(1, Ordering::SeqCst);

        match scripted {
            Some(outcome) => outcome,
            None => Ok(JobRunOutcome {
                status: JobRunStatus::Succeeded,
                job_run_id: Some(format!("job-{}", request.step_id)),
                result: Value::Object(serde_json::Map::new()),
                error_message: None,
            }),
        }
    }
}

/// Static service registry.
#[derive(Default)]
pub struct FakeServiceRegistry {
    /// Registered services by slug.
    pub services: Mutex<HashMap<String, RegisteredService>>,
}

#[async_trait]
impl ServiceRegistry for FakeServiceRegistry {
    async fn find_service(&self, slug: &str) -> AppResult<Option<RegisteredService>> {
        Ok(self.services.lock().await.get(slug).cloned())
    }
}

/// Recording service invoker with scripted responses.
#[derive(Default)]
pub struct FakeServiceInvoker {
    /// Every issued invocation.
    pub invocations: Mutex<Vec<(String, ServiceInvocation)>>,
    /// Scripted responses, popped front first; empty defaults to 200 `{}`.
    pub responses: Mutex<VecDeque<AppResult<ServiceResponse>>>,
}

#[async_trait]
impl ServiceInvoker for FakeServiceInvoker {
    async fn invoke(
        &self,
        service: &RegisteredService,
        invocation: ServiceInvocation,
    ) -> AppResult<ServiceResponse> {
        self.invocations
            .lock()
            .await
            .push((service.slug.clone(), invocation));

        match self.responses.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(ServiceResponse {
                status: 200,
                body: Value::Object(serde_json::Map::new()),
            }),
        }
    }
}

/// Map-backed secret resolver.
#[derive(Default)]
pub struct FakeSecretResolver {
    /// Secrets by name.
    pub secrets: HashMap<String, String>,
}

impl SecretResolver for FakeSecretResolver {
    fn resolve(&self, name: &str) -> AppResult<String> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("secret '{name}' not found")))
    }
}

/// Broadcast-backed bus recording published events.
pub struct FakeEventBus {
    sender: broadcast::Sender<CoreEvent>,
    /// Every published event in order.
    pub published: Mutex<Vec<CoreEvent>>,
}

impl Default for FakeEventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            sender,
            published: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventBus for FakeEventBus {
    async fn publish(&self, event: CoreEvent) -> AppResult<()> {
        self.published.lock().await.push(event.clone());
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

/// Convenience bundle wiring every fake together.
pub struct Fakes {
    /// Workflow store.
    pub workflow_store: Arc<FakeWorkflowStore>,
    /// Trigger store.
    pub trigger_store: Arc<FakeTriggerStore>,
    /// Event store.
    pub event_store: Arc<FakeEventStore>,
    /// Scheduler state store.
    pub scheduler: Arc<FakeSchedulerStore>,
    /// Queue.
    pub queue: Arc<FakeQueue>,
    /// Audit repository.
    pub audit: Arc<FakeAuditRepository>,
    /// Event bus.
    pub bus: Arc<FakeEventBus>,
    /// Job runtime.
    pub job_runtime: Arc<FakeJobRuntime>,
    /// Service registry.
    pub services: Arc<FakeServiceRegistry>,
    /// Service invoker.
    pub invoker: Arc<FakeServiceInvoker>,
    /// Claim store.
    pub claims: Arc<FakeClaimStore>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            workflow_store: Arc::new(FakeWorkflowStore::default()),
            trigger_store: Arc::new(FakeTriggerStore::default()),
            event_store: Arc::new(FakeEventStore::default()),
            scheduler: Arc::new(FakeSchedulerStore::default()),
            queue: Arc::new(FakeQueue::default()),
            audit: Arc::new(FakeAuditRepository::default()),
            bus: Arc::new(FakeEventBus::default()),
            job_runtime: Arc::new(FakeJobRuntime::default()),
            services: Arc::new(FakeServiceRegistry::default()),
            invoker: Arc::new(FakeServiceInvoker::default()),
            claims: Arc::new(FakeClaimStore::default()),
        }
    }
}
