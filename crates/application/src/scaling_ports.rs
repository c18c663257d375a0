//! Ports and record types for runtime scaling policies.

use async_trait::async_trait;
use apphub_core::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::queue_ports::QueueKey;

/// Concurrency bounds configured per scaling target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingTargetConfig {
    /// Lowest accepted desired concurrency; `0` pauses the worker.
    pub min_concurrency: i32,
    /// Highest accepted desired concurrency.
    pub max_concurrency: i32,
    /// Concurrency applied when no policy exists.
    pub default_concurrency: i32,
    /// Minimum interval between value-changing updates.
    pub rate_limit_ms: i64,
}

impl ScalingTargetConfig {
    /// Validates configured bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.min_concurrency < 0 {
            return Err(AppError::Validation(
                "scaling min_concurrency must not be negative".to_owned(),
            ));
        }

        if self.max_concurrency < self.min_concurrency {
            return Err(AppError::Validation(
                "scaling max_concurrency must be at least min_concurrency".to_owned(),
            ));
        }

        if !(self.min_concurrency..=self.max_concurrency).contains(&self.default_concurrency) {
            return Err(AppError::Validation(
                "scaling default_concurrency must sit inside [min, max]".to_owned(),
            ));
        }

        Ok(())
    }

    /// Clamps a requested concurrency into the configured bounds.
    #[must_use]
    pub fn clamp(&self, desired: i32) -> i32 {
        desired.clamp(self.min_concurrency, self.max_concurrency)
    }
}

/// Persisted desired-concurrency policy for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    /// Target queue.
    pub target: QueueKey,
    /// Desired concurrency, clamped into the target bounds.
    pub desired_concurrency: i32,
    /// Last update timestamp, used for rate limiting.
    pub updated_at: DateTime<Utc>,
    /// Updating identity.
    pub updated_by: String,
    /// Optional update reason.
    pub reason: Option<String>,
}

/// Worker acknowledgement status after applying a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAckStatus {
    /// Concurrency applied.
    Applied,
    /// Apply failed; `error` carries the detail.
    Failed,
}

impl ScalingAckStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

/// One worker acknowledgement recorded after a policy apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingAck {
    /// Target queue.
    pub target: QueueKey,
    /// Acknowledging worker instance.
    pub instance_id: String,
    /// Concurrency the worker ended up applying.
    pub applied_concurrency: i32,
    /// Apply outcome.
    pub status: ScalingAckStatus,
    /// Failure detail for failed applies.
    pub error: Option<String>,
    /// Acknowledgement timestamp.
    pub recorded_at: DateTime<Utc>,
}

/// Store port for scaling policies and worker acknowledgements.
#[async_trait]
pub trait ScalingPolicyStore: Send + Sync {
    /// Returns the policy for one target, if any.
    async fn find_policy(&self, target: QueueKey) -> AppResult<Option<ScalingPolicy>>;

    /// Inserts or replaces the policy for one target.
    async fn upsert_policy(&self, policy: &ScalingPolicy) -> AppResult<()>;

    /// Records one worker acknowledgement.
    async fn record_ack(&self, ack: &ScalingAck) -> AppResult<()>;

    /// Lists recent acknowledgements for one target, newest first.
    async fn list_acks(&self, target: QueueKey, limit: usize) -> AppResult<Vec<ScalingAck>>;
}

/// Message multicast to workers over the scaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ScalingMessage {
    /// A policy changed; workers for the target must refresh.
    PolicyUpdate {
        /// Affected target queue key value.
        target: String,
        /// New desired concurrency.
        desired_concurrency: i32,
    },
    /// Every worker must refresh from the store.
    SyncRequest,
}

/// Pub/sub channel multicasting scaling messages to all workers.
#[async_trait]
pub trait ScalingChannel: Send + Sync {
    /// Publishes one message to every subscriber.
    async fn publish(&self, message: ScalingMessage) -> AppResult<()>;

    /// Subscribes to scaling messages.
    fn subscribe(&self) -> broadcast::Receiver<ScalingMessage>;
}
