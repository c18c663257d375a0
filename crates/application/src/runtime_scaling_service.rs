//! Runtime scaling: desired-vs-effective concurrency policies per queue and
//! the worker agent applying them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use apphub_core::{AppError, AppResult, Clock};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::audit_ports::{AuditAction, AuditEvent, AuditRepository};
use crate::queue_ports::QueueKey;
use crate::scaling_ports::{
    ScalingAck, ScalingAckStatus, ScalingChannel, ScalingMessage, ScalingPolicy,
    ScalingPolicyStore, ScalingTargetConfig,
};

/// Effective policy snapshot for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveScalingPolicy {
    /// Target queue.
    pub target: QueueKey,
    /// Concurrency workers must apply.
    pub desired_concurrency: i32,
    /// Configured floor.
    pub min_concurrency: i32,
    /// Configured ceiling.
    pub max_concurrency: i32,
    /// Concurrency applied when no policy row exists.
    pub default_concurrency: i32,
    /// Last update timestamp, absent for the default policy.
    pub updated_at: Option<DateTime<Utc>>,
    /// Last updating identity.
    pub updated_by: Option<String>,
    /// Last update reason.
    pub reason: Option<String>,
}

/// Scaling policy service.
#[derive(Clone)]
pub struct RuntimeScalingService {
    store: Arc<dyn ScalingPolicyStore>,
    channel: Arc<dyn ScalingChannel>,
    audit: Arc<dyn AuditRepository>,
    clock: Arc<dyn Clock>,
    targets: Arc<HashMap<QueueKey, ScalingTargetConfig>>,
}

impl RuntimeScalingService {
    /// Creates a scaling service over validated target configurations.
    pub fn new(
        store: Arc<dyn ScalingPolicyStore>,
        channel: Arc<dyn ScalingChannel>,
        audit: Arc<dyn AuditRepository>,
        clock: Arc<dyn Clock>,
        targets: HashMap<QueueKey, ScalingTargetConfig>,
    ) -> AppResult<Self> {
        for config in targets.values() {
            config.validate()?;
        }

        Ok(Self {
            store,
            channel,
            audit,
            clock,
            targets: Arc::new(targets),
        })
    }

    /// Updates the desired concurrency for one target.
    ///
    /// The request is clamped into the target bounds. Value-changing updates
    /// arriving faster than the target's rate limit are rejected with a
    /// retry-after duration.
    pub async fn update_policy(
        &self,
        actor: &str,
        target: QueueKey,
        desired_concurrency: i32,
        reason: Option<String>,
    ) -> AppResult<EffectiveScalingPolicy> {
        let config = self.target_config(target)?;
        let clamped = config.clamp(desired_concurrency);
        let now = self.clock.now();

        if let Some(existing) = self.store.find_policy(target).await?
            && clamped != existing.desired_concurrency
        {
            let elapsed_ms = (now - existing.updated_at).num_milliseconds();
            if elapsed_ms < config.rate_limit_ms {
                return Err(AppError::RateLimited {
                    message: format!(
                        "scaling updates for '{target}' are limited to one per {}ms",
                        config.rate_limit_ms
                    ),
                    retry_after_ms: u64::try_from(config.rate_limit_ms - elapsed_ms).ok(),
                });
            }
        }

        let policy = ScalingPolicy {
            target,
            desired_concurrency: clamped,
            updated_at: now,
            updated_by: actor.to_owned(),
            reason: reason.clone(),
        };
        self.store.upsert_policy(&policy).await?;

        self.channel
            .publish(ScalingMessage::PolicyUpdate {
                target: target.as_str().to_owned(),
                desired_concurrency: clamped,
            })
            .await?;

        self.audit
            .append_event(AuditEvent {
                actor: actor.to_owned(),
                action: AuditAction::ScalingPolicyUpdated,
                resource_type: "runtime_scaling_policy".to_owned(),
                resource_id: target.as_str().to_owned(),
                detail: Some(format!("desired concurrency {clamped}")),
            })
            .await?;

        Ok(EffectiveScalingPolicy {
            target,
            desired_concurrency: clamped,
            min_concurrency: config.min_concurrency,
            max_concurrency: config.max_concurrency,
            default_concurrency: config.default_concurrency,
            updated_at: Some(now),
            updated_by: Some(actor.to_owned()),
            reason,
        })
    }

    /// Returns the effective policy for one target.
    pub async fn snapshot(&self, target: QueueKey) -> AppResult<EffectiveScalingPolicy> {
        let config = self.target_config(target)?;
        let policy = self.store.find_policy(target).await?;

        Ok(match policy {
            Some(policy) => EffectiveScalingPolicy {
                target,
                desired_concurrency: config.clamp(policy.desired_concurrency),
                min_concurrency: config.min_concurrency,
                max_concurrency: config.max_concurrency,
                default_concurrency: config.default_concurrency,
                updated_at: Some(policy.updated_at),
                updated_by: Some(policy.updated_by),
                reason: policy.reason,
            },
            None => EffectiveScalingPolicy {
                target,
                desired_concurrency: config.default_concurrency,
                min_concurrency: config.min_concurrency,
                max_concurrency: config.max_concurrency,
                default_concurrency: config.default_concurrency,
                updated_at: None,
                updated_by: None,
                reason: None,
            },
        })
    }

    /// Asks every worker to refresh from the store.
    pub async fn request_sync(&self) -> AppResult<()> {
        self.channel.publish(ScalingMessage::SyncRequest).await
    }

    /// Lists recent worker acknowledgements for one target.
    pub async fn list_acks(&self, target: QueueKey, limit: usize) -> AppResult<Vec<ScalingAck>> {
        self.store.list_acks(target, limit).await
    }

    fn target_config(&self, target: QueueKey) -> AppResult<ScalingTargetConfig> {
        self.targets.get(&target).copied().ok_or_else(|| {
            AppError::Validation(format!("queue '{target}' has no scaling target configured"))
        })
    }
}

/// Worker-side hook applying a concurrency value to a queue consumer.
///
/// A value of `0` pauses the worker but keeps it registered.
#[async_trait]
pub trait ConcurrencyHandle: Send + Sync {
    /// Applies the concurrency to the underlying consumer.
    async fn apply(&self, concurrency: i32) -> AppResult<()>;
}

/// Worker agent keeping one queue consumer aligned with its policy.
pub struct ScalingAgent {
    service: RuntimeScalingService,
    target: QueueKey,
    instance_id: String,
    handle: Arc<dyn ConcurrencyHandle>,
    applied: Option<i32>,
}

impl ScalingAgent {
    /// Creates an agent for one target.
    #[must_use]
    pub fn new(
        service: RuntimeScalingService,
        target: QueueKey,
        instance_id: String,
        handle: Arc<dyn ConcurrencyHandle>,
    ) -> Self {
        Self {
            service,
            target,
            instance_id,
            handle,
            applied: None,
        }
    }

    /// Runs the agent: applies the snapshot, then follows channel messages.
    ///
    /// Messages arriving while a refresh is in flight collapse into a single
    /// pending refresh instead of stacking.
    pub async fn run(mut self, mut messages: broadcast::Receiver<ScalingMessage>) {
        if let Err(error) = self.refresh_and_apply().await {
            warn!(target = %self.target, error = %error, "initial scaling refresh failed");
        }

        loop {
            match messages.recv().await {
                Ok(message) => {
                    if !self.message_applies(&message) {
                        continue;
                    }

                    // Collapse any queued messages into this refresh.
                    while let Ok(extra) = messages.try_recv() {
                        let _ = self.message_applies(&extra);
                    }

                    if let Err(error) = self.refresh_and_apply().await {
                        warn!(target = %self.target, error = %error, "scaling refresh failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = %self.target, skipped, "scaling channel lagged; refreshing");
                    if let Err(error) = self.refresh_and_apply().await {
                        warn!(target = %self.target, error = %error, "scaling refresh failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Refreshes the policy from the store, applies it, and records an ack.
    pub async fn refresh_and_apply(&mut self) -> AppResult<i32> {
        let snapshot = self.service.snapshot(self.target).await?;
        let desired = snapshot.desired_concurrency;

        if self.applied == Some(desired) {
            return Ok(desired);
        }

        let (status, error) = match self.handle.apply(desired).await {
            Ok(()) => {
                self.applied = Some(desired);
                info!(
                    target = %self.target,
                    instance_id = %self.instance_id,
                    concurrency = desired,
                    "scaling policy applied"
                );
                (ScalingAckStatus::Applied, None)
            }
            Err(error) => (ScalingAckStatus::Failed, Some(error.to_string())),
        };

        self.service
            .store
            .record_ack(&ScalingAck {
                target: self.target,
                instance_id: self.instance_id.clone(),
                applied_concurrency: self.applied.unwrap_or_default(),
                status,
                error,
                recorded_at: self.service.clock.now(),
            })
            .await?;

        Ok(desired)
    }

    fn message_applies(&self, message: &ScalingMessage) -> bool {
        match message {
            ScalingMessage::PolicyUpdate { target, .. } => target == self.target.as_str(),
            ScalingMessage::SyncRequest => true,
        }
    }
}

#[cfg(test)]
mod tests;
