use apphub_core::{AppError, AppResult};
use apphub_domain::{
    WorkflowDefinition, WorkflowStep, extract_produced_assets, normalize_asset_id,
    normalize_partition_key,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::event_bus::AssetProducedNotice;
use crate::workflow_ports::{WorkflowRun, WorkflowRunStepAsset};

use super::WorkflowService;

impl WorkflowService {
    /// Extracts produced assets from a step result and persists them.
    ///
    /// Records are matched against the step's declarations case-insensitively.
    /// A partitioned declaration without a record- or run-level partition key
    /// fails the step. Returned notices are published by the caller only
    /// after the shared scope is durable.
    pub(super) async fn persist_step_assets(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        run: &WorkflowRun,
        result: &Value,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<AssetProducedNotice>> {
        if step.produces.is_empty() {
            return Ok(Vec::new());
        }

        let produced = extract_produced_assets(result);
        let mut notices = Vec::new();

        for declaration in &step.produces {
            let normalized = declaration.normalized_id();
            let Some(record) = produced
                .iter()
                .find(|record| normalize_asset_id(record.asset_id.as_str()) == normalized)
            else {
                continue;
            };

            let partition_key = record
                .partition_key
                .clone()
                .or_else(|| run.partition_key.clone());

            if declaration.is_partitioned()
                && partition_key.as_deref().is_none_or(|key| key.trim().is_empty())
            {
                return Err(AppError::PartitionKeyRequired(format!(
                    "asset '{}' is partitioned but step '{}' produced no partition key",
                    declaration.asset_id, step.id
                )));
            }

            let produced_at = record.produced_at.unwrap_or(now);
            let freshness = record.freshness.or(declaration.freshness);

            let asset = WorkflowRunStepAsset {
                run_id: run.id,
                workflow_definition_id: run.workflow_definition_id,
                step_id: step.id.clone(),
                asset_id: declaration.asset_id.clone(),
                asset_id_normalized: normalized.clone(),
                partition_key: partition_key.clone(),
                partition_key_normalized: normalize_partition_key(partition_key.as_deref()),
                produced_at,
                payload: record.payload.clone(),
                schema: record.schema.clone().or_else(|| declaration.schema.clone()),
                freshness,
            };

            self.store.record_step_asset(&asset).await?;
            self.store
                .clear_partition_stale(
                    run.workflow_definition_id,
                    normalized.as_str(),
                    partition_key.as_deref(),
                )
                .await?;

            notices.push(AssetProducedNotice {
                workflow_definition_id: run.workflow_definition_id,
                workflow_slug: definition.slug().to_owned(),
                run_id: run.id,
                step_id: step.id.clone(),
                asset_id: normalized,
                partition_key,
                produced_at,
                freshness,
            });
        }

        Ok(notices)
    }
}
