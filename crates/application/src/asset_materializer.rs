//! Auto-materialization engine.
//!
//! The materializer owns an in-memory view of the asset graph and reacts to
//! internal bus events. All state lives inside one task; external code only
//! sends it events, so no locking is needed around the graph.

use std::collections::{HashMap, HashSet};

use apphub_core::run_key::compose_run_key;
use apphub_core::{AppResult, Clock, RunId, WorkflowId};
use apphub_domain::{
    AssetDeclaration, AssetPartitioning, merge_parameter_layers, normalize_asset_id,
    normalize_partition_key, partition_window,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::event_bus::{AssetExpiredNotice, AssetProducedNotice, CoreEvent};
use crate::run_claim_service::RunClaimService;
use crate::workflow_ports::{
    AutoRunFailureState, CreateWorkflowRunInput, WorkflowRunStatus, WorkflowRunTrigger,
    WorkflowStore,
};
use crate::workflow_service::WorkflowService;

/// Default base backoff after an auto-run failure.
pub const DEFAULT_BASE_BACKOFF_MS: i64 = 10_000;
/// Default cap on auto-run failure backoff.
pub const DEFAULT_MAX_BACKOFF_MS: i64 = 600_000;
/// Default interval between full graph refreshes.
pub const DEFAULT_REFRESH_INTERVAL_MS: i64 = 300_000;

/// Materializer knobs, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Identity used as the claim owner.
    pub instance_id: String,
    /// Base backoff after an auto-run failure.
    pub base_backoff_ms: i64,
    /// Cap on the failure backoff.
    pub max_backoff_ms: i64,
    /// Interval between full graph refreshes.
    pub refresh_interval_ms: i64,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("materializer-{}", std::process::id()),
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
        }
    }
}

/// Why one auto run was considered.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterializeCause {
    /// A consumed upstream asset updated.
    Upstream(AssetProducedNotice),
    /// A produced asset partition expired.
    Expiry(AssetExpiredNotice),
}

impl MaterializeCause {
    fn reason(&self) -> &'static str {
        match self {
            Self::Upstream(_) => "upstream-update",
            Self::Expiry(_) => "expiry",
        }
    }

    fn asset_id(&self) -> &str {
        match self {
            Self::Upstream(notice) => notice.asset_id.as_str(),
            Self::Expiry(notice) => notice.asset_id.as_str(),
        }
    }

    fn partition_key(&self) -> Option<&str> {
        match self {
            Self::Upstream(notice) => notice.partition_key.as_deref(),
            Self::Expiry(notice) => notice.partition_key.as_deref(),
        }
    }
}

/// Outcome of one `consider` call, surfaced for observability and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsiderOutcome {
    /// A new auto run was created and enqueued.
    Launched {
        /// Created run.
        run_id: RunId,
    },
    /// A run-key conflict re-enqueued the existing active run.
    ReusedExisting {
        /// Existing active run.
        run_id: RunId,
    },
    /// An auto run is already in flight for the workflow.
    SkippedInFlight,
    /// The workflow is inside its failure backoff window.
    SkippedBackoff,
    /// The latest materialization already covers the cause.
    SkippedFresh,
    /// The workflow does not auto-materialize for this cause.
    SkippedNotConfigured,
}

struct WorkflowAutoConfig {
    slug: String,
    default_parameters: Value,
    producers: HashMap<String, AssetDeclaration>,
    consumers: HashSet<String>,
    on_upstream_update: bool,
}

#[derive(Clone, Copy)]
struct LatestAsset {
    produced_at: DateTime<Utc>,
}

/// The materializer worker. Owns the graph; drive it with [`run`] or feed it
/// events directly in tests via [`handle_event`].
///
/// [`run`]: AssetMaterializer::run
/// [`handle_event`]: AssetMaterializer::handle_event
pub struct AssetMaterializer {
    store: Arc<dyn WorkflowStore>,
    claims: RunClaimService,
    workflows: WorkflowService,
    clock: Arc<dyn Clock>,
    config: MaterializerConfig,
    workflow_configs: HashMap<WorkflowId, WorkflowAutoConfig>,
    asset_consumers: HashMap<String, HashSet<WorkflowId>>,
    latest_assets: HashMap<(WorkflowId, String), HashMap<String, LatestAsset>>,
}

impl AssetMaterializer {
    /// Creates a materializer with an empty graph.
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        claims: RunClaimService,
        workflows: WorkflowService,
        clock: Arc<dyn Clock>,
        config: MaterializerConfig,
    ) -> Self {
        Self {
            store,
            claims,
            workflows,
            clock,
            config,
            workflow_configs: HashMap::new(),
            asset_consumers: HashMap::new(),
            latest_assets: HashMap::new(),
        }
    }

    /// Rebuilds the whole graph and cleans up stale claims. Run at startup
    /// and on the periodic refresh tick.
    pub async fn bootstrap(&mut self) -> AppResult<()> {
        self.claims.cleanup_expired().await?;

        let definitions = self.store.list_definitions().await?;
        self.workflow_configs.clear();
        self.asset_consumers.clear();
        self.latest_assets.clear();

        for definition in definitions {
            self.rebuild_workflow(definition.id()).await?;
        }

        info!(
            workflows = self.workflow_configs.len(),
            consumed_assets = self.asset_consumers.len(),
            "asset materializer graph rebuilt"
        );
        Ok(())
    }

    /// Drives the materializer until `shutdown` flips.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<CoreEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(error) = self.bootstrap().await {
            warn!(error = %error, "asset materializer bootstrap failed");
        }

        let refresh_ms = u64::try_from(self.config.refresh_interval_ms.max(1_000)).unwrap_or(300_000);
        let mut refresh = tokio::time::interval(std::time::Duration::from_millis(refresh_ms));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = refresh.tick() => {
                    if let Err(error) = self.bootstrap().await {
                        warn!(error = %error, "asset materializer refresh failed");
                    }
                }
                received = events.recv() => {
                    match received {
                        Ok(event) => {
                            if let Err(error) = self.handle_event(event).await {
                                warn!(error = %error, "asset materializer event handling failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "asset materializer lagged; rebuilding graph");
                            if let Err(error) = self.bootstrap().await {
                                warn!(error = %error, "asset materializer rebuild failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    /// Applies one bus event to the graph.
    pub async fn handle_event(&mut self, event: CoreEvent) -> AppResult<()> {
        match event {
            CoreEvent::WorkflowDefinitionUpdated {
                workflow_definition_id,
                ..
            } => self.rebuild_workflow(workflow_definition_id).await,
            CoreEvent::AssetProduced(notice) => {
                self.record_latest(&notice);

                let consumers: Vec<WorkflowId> = self
                    .asset_consumers
                    .get(notice.asset_id.as_str())
                    .map(|consumers| consumers.iter().copied().collect())
                    .unwrap_or_default();

                for workflow_id in consumers {
                    let on_upstream = self
                        .workflow_configs
                        .get(&workflow_id)
                        .is_some_and(|config| config.on_upstream_update);
                    if !on_upstream || workflow_id == notice.workflow_definition_id {
                        continue;
                    }

                    self.consider(workflow_id, MaterializeCause::Upstream(notice.clone()))
                        .await?;
                }
                Ok(())
            }
            CoreEvent::AssetExpired(notice) => {
                self.consider(
                    notice.workflow_definition_id,
                    MaterializeCause::Expiry(notice),
                )
                .await
                .map(|_| ())
            }
            CoreEvent::WorkflowRunCompleted {
                run_id,
                workflow_definition_id,
                status,
                trigger_type,
            } => {
                if trigger_type != "auto-materialize" {
                    return Ok(());
                }

                self.claims.release_run(workflow_definition_id, run_id).await?;

                match status {
                    WorkflowRunStatus::Succeeded => {
                        self.store.clear_auto_run_failure(workflow_definition_id).await
                    }
                    WorkflowRunStatus::Failed | WorkflowRunStatus::Canceled => {
                        self.record_auto_run_failure(workflow_definition_id).await
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Decides whether to schedule one auto run for a workflow.
    pub async fn consider(
        &mut self,
        workflow_id: WorkflowId,
        cause: MaterializeCause,
    ) -> AppResult<ConsiderOutcome> {
        if !self.workflow_configs.contains_key(&workflow_id) {
            self.rebuild_workflow(workflow_id).await?;
        }

        let Some(config) = self.workflow_configs.get(&workflow_id) else {
            return Ok(ConsiderOutcome::SkippedNotConfigured);
        };

        let asset_id = normalize_asset_id(cause.asset_id());

        let declaration = match &cause {
            MaterializeCause::Upstream(notice) => {
                if !config.on_upstream_update || !config.consumers.contains(asset_id.as_str()) {
                    return Ok(ConsiderOutcome::SkippedNotConfigured);
                }

                // Already rematerialized since the upstream update.
                let newest_own = self.newest_materialization(workflow_id);
                if newest_own.is_some_and(|produced_at| produced_at >= notice.produced_at) {
                    return Ok(ConsiderOutcome::SkippedFresh);
                }

                config.producers.values().find(|declaration| {
                    declaration
                        .auto_materialize
                        .as_ref()
                        .is_some_and(|policy| policy.on_upstream_update)
                })
            }
            MaterializeCause::Expiry(notice) => {
                let Some(declaration) = config.producers.get(asset_id.as_str()) else {
                    return Ok(ConsiderOutcome::SkippedNotConfigured);
                };

                let partition = normalize_partition_key(notice.partition_key.as_deref());
                let newer = self
                    .latest_assets
                    .get(&(workflow_id, asset_id.clone()))
                    .and_then(|partitions| partitions.get(partition.as_str()))
                    .is_some_and(|latest| latest.produced_at > notice.produced_at);
                if newer {
                    return Ok(ConsiderOutcome::SkippedFresh);
                }

                Some(declaration)
            }
        };

        if self.claims.find_claim(workflow_id).await?.is_some() {
            return Ok(ConsiderOutcome::SkippedInFlight);
        }

        let now = self.clock.now();
        if let Some(state) = self.store.find_auto_run_failure_state(workflow_id).await?
            && state.next_eligible_at.is_some_and(|at| at > now)
        {
            return Ok(ConsiderOutcome::SkippedBackoff);
        }

        let parameters = compose_parameters(
            &config.default_parameters,
            declaration,
            cause.partition_key(),
        );

        let claimed = self
            .claims
            .claim(
                workflow_id,
                self.config.instance_id.as_str(),
                cause.reason(),
                asset_id.as_str(),
                cause.partition_key(),
            )
            .await?;
        if !claimed {
            return Ok(ConsiderOutcome::SkippedInFlight);
        }

        let discriminator = match &cause {
            MaterializeCause::Upstream(notice) => notice.run_id.to_string(),
            MaterializeCause::Expiry(notice) => notice.reason.clone(),
        };

        let run_key = compose_run_key([
            "asset",
            asset_id.as_str(),
            cause.partition_key().unwrap_or_default(),
            cause.reason(),
            discriminator.as_str(),
        ]);

        let input = CreateWorkflowRunInput {
            workflow_definition_id: workflow_id,
            run_key: Some(run_key),
            parameters,
            trigger: WorkflowRunTrigger {
                trigger_type: "auto-materialize".to_owned(),
                payload: json!({
                    "reason": cause.reason(),
                    "assetId": asset_id,
                    "partitionKey": cause.partition_key(),
                }),
            },
            triggered_by: Some(format!("asset-materializer:{}", self.config.instance_id)),
            partition_key: cause.partition_key().map(ToOwned::to_owned),
        };

        let outcome = match self.workflows.create_run(input).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.claims
                    .release_owner(workflow_id, self.config.instance_id.as_str())
                    .await?;
                return Err(error);
            }
        };

        if outcome.is_created() {
            let run_id = outcome.run().id;
            self.claims
                .attach_run(workflow_id, self.config.instance_id.as_str(), run_id)
                .await?;
            self.workflows.enqueue_run(outcome.run()).await?;

            info!(
                workflow_id = %workflow_id,
                run_id = %run_id,
                asset_id = %asset_id,
                reason = cause.reason(),
                "auto-materialization run enqueued"
            );
            Ok(ConsiderOutcome::Launched { run_id })
        } else {
            // Another scheduler already owns this logical run.
            self.claims
                .release_owner(workflow_id, self.config.instance_id.as_str())
                .await?;
            self.workflows.enqueue_run(outcome.run()).await?;
            Ok(ConsiderOutcome::ReusedExisting {
                run_id: outcome.run().id,
            })
        }
    }

    async fn rebuild_workflow(&mut self, workflow_id: WorkflowId) -> AppResult<()> {
        let Some(definition) = self.store.find_definition(workflow_id).await? else {
            self.remove_workflow(workflow_id);
            return Ok(());
        };

        self.remove_workflow(workflow_id);

        let mut producers = HashMap::new();
        let mut consumers = HashSet::new();
        for step in definition.steps() {
            for declaration in &step.produces {
                producers.insert(declaration.normalized_id(), declaration.clone());
            }
            for consumption in &step.consumes {
                consumers.insert(consumption.normalized_id());
            }
        }

        let on_upstream_update = producers.values().any(|declaration| {
            declaration
                .auto_materialize
                .as_ref()
                .is_some_and(|policy| policy.on_upstream_update)
        });

        for consumed in &consumers {
            self.asset_consumers
                .entry(consumed.clone())
                .or_default()
                .insert(workflow_id);
        }

        for materialization in self.store.latest_materializations(workflow_id).await? {
            self.latest_assets
                .entry((workflow_id, materialization.asset_id.clone()))
                .or_default()
                .insert(
                    normalize_partition_key(materialization.partition_key.as_deref()),
                    LatestAsset {
                        produced_at: materialization.produced_at,
                    },
                );
        }

        self.workflow_configs.insert(
            workflow_id,
            WorkflowAutoConfig {
                slug: definition.slug().to_owned(),
                default_parameters: definition.default_parameters().clone(),
                producers,
                consumers,
                on_upstream_update,
            },
        );

        Ok(())
    }

    fn remove_workflow(&mut self, workflow_id: WorkflowId) {
        self.workflow_configs.remove(&workflow_id);
        for consumers in self.asset_consumers.values_mut() {
            consumers.remove(&workflow_id);
        }
        self.asset_consumers.retain(|_, consumers| !consumers.is_empty());
        self.latest_assets
            .retain(|(stored_workflow_id, _), _| *stored_workflow_id != workflow_id);
    }

    fn record_latest(&mut self, notice: &AssetProducedNotice) {
        let partitions = self
            .latest_assets
            .entry((notice.workflow_definition_id, notice.asset_id.clone()))
            .or_default();
        let slot = normalize_partition_key(notice.partition_key.as_deref());

        let replace = partitions
            .get(slot.as_str())
            .is_none_or(|latest| latest.produced_at <= notice.produced_at);
        if replace {
            partitions.insert(
                slot,
                LatestAsset {
                    produced_at: notice.produced_at,
                },
            );
        }
    }

    fn newest_materialization(&self, workflow_id: WorkflowId) -> Option<DateTime<Utc>> {
        self.latest_assets
            .iter()
            .filter(|((stored_workflow_id, _), _)| *stored_workflow_id == workflow_id)
            .flat_map(|(_, partitions)| partitions.values())
            .map(|latest| latest.produced_at)
            .max()
    }

    async fn record_auto_run_failure(&self, workflow_id: WorkflowId) -> AppResult<()> {
        let failures = self
            .store
            .find_auto_run_failure_state(workflow_id)
            .await?
            .map_or(0, |state| state.failures)
            + 1;

        let exponent = u32::try_from(failures - 1).unwrap_or(0).min(31);
        let backoff_ms = self
            .config
            .base_backoff_ms
            .saturating_mul(1_i64 << exponent)
            .min(self.config.max_backoff_ms);

        self.store
            .record_auto_run_failure(AutoRunFailureState {
                workflow_definition_id: workflow_id,
                failures,
                next_eligible_at: Some(self.clock.now() + Duration::milliseconds(backoff_ms)),
            })
            .await
    }

    /// Returns the slug of one tracked workflow, for observability surfaces.
    #[must_use]
    pub fn workflow_slug(&self, workflow_id: WorkflowId) -> Option<&str> {
        self.workflow_configs
            .get(&workflow_id)
            .map(|config| config.slug.as_str())
    }
}

fn compose_parameters(
    defaults: &Value,
    declaration: Option<&AssetDeclaration>,
    partition_key: Option<&str>,
) -> Value {
    let declaration_defaults = declaration
        .and_then(|declaration| declaration.auto_materialize.as_ref())
        .map(|policy| policy.parameter_defaults.clone())
        .unwrap_or(Value::Null);

    let stored_partition = partition_key
        .map(|key| json!({"partitionKey": key}))
        .unwrap_or(Value::Null);

    let derived_partition = match (declaration.and_then(|declaration| declaration.partitioning.as_ref()), partition_key) {
        (Some(AssetPartitioning::TimeWindow { granularity: Some(granularity) }), Some(key)) => {
            partition_window(*granularity, key)
                .map(|window| {
                    json!({
                        "windowStart": window.start.to_rfc3339(),
                        "windowEnd": window.end.to_rfc3339(),
                    })
                })
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    };

    let merged = merge_parameter_layers(&[
        defaults,
        &declaration_defaults,
        &stored_partition,
        &derived_partition,
    ]);

    if merged.is_object() {
        merged
    } else {
        Value::Object(Map::new())
    }
}
