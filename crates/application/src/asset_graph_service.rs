//! Read-side aggregation of producers, consumers, materializations, and
//! stale partitions per asset.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use apphub_core::{AppResult, Clock, WorkflowId};
use apphub_domain::{normalize_asset_id, normalize_partition_key};
use chrono::{DateTime, Utc};

use crate::event_bus::{AssetExpiredNotice, CoreEvent, EventBus};
use crate::workflow_ports::{AssetMaterialization, StalePartitionFlag, WorkflowStore};

/// One workflow step producing or consuming an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetStepRef {
    /// Workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Workflow slug.
    pub workflow_slug: String,
    /// Step identifier.
    pub step_id: String,
}

/// Aggregated view of one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetGraphNode {
    /// Normalized asset identifier.
    pub asset_id: String,
    /// Steps declaring production of this asset.
    pub producers: Vec<AssetStepRef>,
    /// Steps consuming this asset.
    pub consumers: Vec<AssetStepRef>,
    /// Latest materialization per producing workflow and partition.
    pub latest_materializations: Vec<AssetMaterialization>,
    /// Operator stale flags.
    pub stale_partitions: Vec<StalePartitionFlag>,
    /// Whether any stale flag is set.
    pub has_stale_partitions: bool,
    /// Whether any direct upstream is newer than this asset.
    pub has_outdated_upstreams: bool,
    /// Upstream assets newer than this asset.
    pub outdated_upstream_asset_ids: Vec<String>,
}

/// One dependency edge between assets, introduced by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetGraphEdge {
    /// Consumed asset.
    pub from_asset_id: String,
    /// Produced asset.
    pub to_asset_id: String,
    /// Workflow introducing the edge.
    pub workflow_definition_id: WorkflowId,
    /// Step introducing the edge.
    pub via_step_id: String,
}

/// Full asset graph snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetGraph {
    /// Nodes sorted by asset id.
    pub nodes: Vec<AssetGraphNode>,
    /// Edges in definition order.
    pub edges: Vec<AssetGraphEdge>,
}

/// Read-side service building asset graph snapshots.
#[derive(Clone)]
pub struct AssetGraphService {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl AssetGraphService {
    /// Creates a graph service.
    #[must_use]
    pub fn new(store: Arc<dyn WorkflowStore>, bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { store, bus, clock }
    }

    /// Builds the graph across every workflow definition.
    ///
    /// The build reads a snapshot; it never holds store locks while
    /// aggregating.
    pub async fn build(&self) -> AppResult<AssetGraph> {
        let definitions = self.store.list_definitions().await?;

        let mut producers: BTreeMap<String, Vec<AssetStepRef>> = BTreeMap::new();
        let mut consumers: BTreeMap<String, Vec<AssetStepRef>> = BTreeMap::new();
        let mut edges = Vec::new();

        for definition in &definitions {
            for step in definition.steps() {
                let reference = AssetStepRef {
                    workflow_definition_id: definition.id(),
                    workflow_slug: definition.slug().to_owned(),
                    step_id: step.id.clone(),
                };

                for declaration in &step.produces {
                    producers
                        .entry(declaration.normalized_id())
                        .or_default()
                        .push(reference.clone());
                }

                for consumption in &step.consumes {
                    consumers
                        .entry(consumption.normalized_id())
                        .or_default()
                        .push(reference.clone());
                }

                for consumption in &step.consumes {
                    for declaration in &step.produces {
                        edges.push(AssetGraphEdge {
                            from_asset_id: consumption.normalized_id(),
                            to_asset_id: declaration.normalized_id(),
                            workflow_definition_id: definition.id(),
                            via_step_id: step.id.clone(),
                        });
                    }
                }
            }
        }

        let mut latest_by_asset: HashMap<String, Vec<AssetMaterialization>> = HashMap::new();
        let mut stale_by_asset: HashMap<String, Vec<StalePartitionFlag>> = HashMap::new();
        for definition in &definitions {
            for materialization in self.store.latest_materializations(definition.id()).await? {
                latest_by_asset
                    .entry(materialization.asset_id.clone())
                    .or_default()
                    .push(materialization);
            }

            for flag in self.store.list_stale_partitions(definition.id()).await? {
                stale_by_asset.entry(flag.asset_id.clone()).or_default().push(flag);
            }
        }

        let mut asset_ids: HashSet<String> = HashSet::new();
        asset_ids.extend(producers.keys().cloned());
        asset_ids.extend(consumers.keys().cloned());
        let mut asset_ids: Vec<String> = asset_ids.into_iter().collect();
        asset_ids.sort();

        let nodes = asset_ids
            .into_iter()
            .map(|asset_id| {
                let latest = latest_by_asset.get(asset_id.as_str()).cloned().unwrap_or_default();
                let stale = stale_by_asset.get(asset_id.as_str()).cloned().unwrap_or_default();

                let upstreams: Vec<&str> = edges
                    .iter()
                    .filter(|edge| edge.to_asset_id == asset_id)
                    .map(|edge| edge.from_asset_id.as_str())
                    .collect();

                let mut outdated: Vec<String> = upstreams
                    .iter()
                    .filter(|upstream| {
                        upstream_is_newer(
                            latest_by_asset.get(**upstream).map(Vec::as_slice).unwrap_or_default(),
                            latest.as_slice(),
                        )
                    })
                    .map(|upstream| (*upstream).to_owned())
                    .collect();
                outdated.sort();
                outdated.dedup();

                AssetGraphNode {
                    has_stale_partitions: !stale.is_empty(),
                    has_outdated_upstreams: !outdated.is_empty(),
                    outdated_upstream_asset_ids: outdated,
                    producers: producers.get(asset_id.as_str()).cloned().unwrap_or_default(),
                    consumers: consumers.get(asset_id.as_str()).cloned().unwrap_or_default(),
                    latest_materializations: latest,
                    stale_partitions: stale,
                    asset_id,
                }
            })
            .collect();

        Ok(AssetGraph { nodes, edges })
    }

    /// Flags one asset partition stale and nudges the materializer through
    /// the expiry path.
    pub async fn mark_partition_stale(
        &self,
        requested_by: &str,
        workflow_definition_id: WorkflowId,
        asset_id: &str,
        partition_key: Option<&str>,
        note: Option<String>,
    ) -> AppResult<()> {
        let now = self.clock.now();
        let normalized = normalize_asset_id(asset_id);

        self.store
            .mark_partition_stale(&StalePartitionFlag {
                workflow_definition_id,
                asset_id: normalized.clone(),
                partition_key: partition_key.map(ToOwned::to_owned),
                requested_at: now,
                requested_by: requested_by.to_owned(),
                note,
            })
            .await?;

        let produced_at = self
            .store
            .find_latest_materialization(
                workflow_definition_id,
                normalized.as_str(),
                normalize_partition_key(partition_key).as_str(),
            )
            .await?
            .map_or(DateTime::<Utc>::MIN_UTC, |latest| latest.produced_at);

        self.bus
            .publish(CoreEvent::AssetExpired(AssetExpiredNotice {
                workflow_definition_id,
                asset_id: normalized,
                partition_key: partition_key.map(ToOwned::to_owned),
                produced_at,
                reason: "manual".to_owned(),
                expired_at: now,
            }))
            .await
    }

    /// Clears one stale flag.
    pub async fn clear_partition_stale(
        &self,
        workflow_definition_id: WorkflowId,
        asset_id: &str,
        partition_key: Option<&str>,
    ) -> AppResult<()> {
        self.store
            .clear_partition_stale(
                workflow_definition_id,
                normalize_asset_id(asset_id).as_str(),
                partition_key,
            )
            .await
    }
}

/// Returns whether any upstream materialization is newer than the downstream
/// one covering the same slice; partitioned comparisons are partition-keyed.
fn upstream_is_newer(
    upstream: &[AssetMaterialization],
    downstream: &[AssetMaterialization],
) -> bool {
    if upstream.is_empty() {
        return false;
    }

    if downstream.is_empty() {
        return true;
    }

    upstream.iter().any(|up| {
        let partition = normalize_partition_key(up.partition_key.as_deref());
        let counterpart = downstream
            .iter()
            .filter(|down| {
                normalize_partition_key(down.partition_key.as_deref()) == partition
                    || down.partition_key.is_none()
            })
            .map(|down| down.produced_at)
            .max();

        match counterpart {
            Some(produced_at) => up.produced_at > produced_at,
            // No downstream coverage for this partition yet.
            None => true,
        }
    })
}

#[cfg(test)]
mod tests;
