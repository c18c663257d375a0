//! Internal event bus notifying the materializer and other listeners.

use async_trait::async_trait;
use apphub_core::{AppResult, RunId, WorkflowId};
use apphub_domain::FreshnessPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::workflow_ports::WorkflowRunStatus;

/// Notification that a step produced an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetProducedNotice {
    /// Producing workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Producing workflow slug.
    pub workflow_slug: String,
    /// Producing run.
    pub run_id: RunId,
    /// Producing step.
    pub step_id: String,
    /// Normalized asset identifier.
    pub asset_id: String,
    /// Affected partition key.
    pub partition_key: Option<String>,
    /// Production timestamp.
    pub produced_at: DateTime<Utc>,
    /// Freshness attached to the materialization.
    pub freshness: Option<FreshnessPolicy>,
}

/// Notification that an asset partition expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetExpiredNotice {
    /// Producing workflow definition.
    pub workflow_definition_id: WorkflowId,
    /// Normalized asset identifier.
    pub asset_id: String,
    /// Expired partition key.
    pub partition_key: Option<String>,
    /// Production timestamp of the expired materialization.
    pub produced_at: DateTime<Utc>,
    /// Expiry reason: `ttl`, `cadence`, or `manual`.
    pub reason: String,
    /// Expiry detection timestamp.
    pub expired_at: DateTime<Utc>,
}

/// Event published on the internal bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoreEvent {
    /// A workflow definition was created or updated.
    #[serde(rename = "workflow.definition.updated")]
    WorkflowDefinitionUpdated {
        /// Affected workflow definition.
        workflow_definition_id: WorkflowId,
        /// Affected workflow slug.
        slug: String,
        /// New definition version.
        version: i32,
    },
    /// A step produced an asset; published only after the materialization,
    /// shared scope, and step result are durable.
    #[serde(rename = "asset.produced")]
    AssetProduced(AssetProducedNotice),
    /// An asset partition expired.
    #[serde(rename = "asset.expired")]
    AssetExpired(AssetExpiredNotice),
    /// A workflow run reached a terminal status.
    #[serde(rename = "workflow.run.completed")]
    WorkflowRunCompleted {
        /// Completed run.
        run_id: RunId,
        /// Executed workflow definition.
        workflow_definition_id: WorkflowId,
        /// Terminal status.
        status: WorkflowRunStatus,
        /// Trigger category of the run.
        trigger_type: String,
    },
}

/// Pub/sub port for internal core events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes one event to every subscriber.
    async fn publish(&self, event: CoreEvent) -> AppResult<()>;

    /// Subscribes to core events.
    fn subscribe(&self) -> broadcast::Receiver<CoreEvent>;
}
