//! Event ingress: normalize, annotate, persist, and route envelopes through
//! source pause and rate-limit state.

use std::sync::Arc;

use apphub_core::run_key::scheduled_job_id;
use apphub_core::{AppResult, Clock};
use apphub_domain::{BackoffConfig, EventEnvelope, EventEnvelopeInput};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::audit_ports::{AuditAction, AuditEvent, AuditRepository};
use crate::event_ports::{EventStore, IngressRetry};
use crate::event_schema_service::EventSchemaRegistry;
use crate::queue_ports::{
    EnqueueDisposition, JOB_EVENT_INGRESS_RETRY, JOB_TRIGGER_EVALUATE, JobQueue, QueueJob,
    QueueKey,
};
use crate::scheduler_ports::{
    RateLimitDecision, SchedulerStateStore, SourceMetrics, SourceMetricsUpdate, SourcePauseState,
    SourceRateLimit,
};

/// Ingress behavior knobs, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Per-source rate limits.
    pub rate_limits: Vec<SourceRateLimit>,
    /// Backoff applied to scheduled ingress retries.
    pub retry_backoff: BackoffConfig,
    /// Retry attempts before an envelope is dropped.
    pub max_attempts: u32,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            rate_limits: Vec::new(),
            retry_backoff: BackoffConfig::default(),
            max_attempts: 10,
        }
    }
}

/// How one envelope left the ingress pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Handed off to trigger evaluation.
    Accepted {
        /// Persisted envelope.
        envelope: EventEnvelope,
    },
    /// Parked behind a scheduled retry.
    Scheduled {
        /// Persisted envelope.
        envelope: EventEnvelope,
        /// Scheduled next attempt time.
        next_attempt_at: DateTime<Utc>,
        /// Retry attempts so far.
        attempts: i32,
    },
}

/// How one scheduled retry was processed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Retry state was gone, cancelled, or exhausted; nothing happened.
    Dropped,
    /// Source still paused; a new retry was scheduled.
    Rescheduled {
        /// New next attempt time.
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry state deleted and the envelope handed to trigger evaluation.
    Completed,
}

/// Ingress service for event envelopes.
#[derive(Clone)]
pub struct EventIngressService {
    schemas: Arc<EventSchemaRegistry>,
    events: Arc<dyn EventStore>,
    scheduler: Arc<dyn SchedulerStateStore>,
    queue: Arc<dyn JobQueue>,
    audit: Arc<dyn AuditRepository>,
    clock: Arc<dyn Clock>,
    config: IngressConfig,
}

impl EventIngressService {
    /// Creates an ingress service.
    #[must_use]
    pub fn new(
        schemas: Arc<EventSchemaRegistry>,
        events: Arc<dyn EventStore>,
        scheduler: Arc<dyn SchedulerStateStore>,
        queue: Arc<dyn JobQueue>,
        audit: Arc<dyn AuditRepository>,
        clock: Arc<dyn Clock>,
        config: IngressConfig,
    ) -> Self {
        Self {
            schemas,
            events,
            scheduler,
            queue,
            audit,
            clock,
            config,
        }
    }

    /// Ingests one envelope.
    ///
    /// Normalization, annotation, and persistence errors abort and surface to
    /// the caller; pause and rate-limit outcomes park the envelope behind a
    /// scheduled retry instead.
    pub async fn ingest(&self, input: EventEnvelopeInput) -> AppResult<IngestOutcome> {
        let envelope = EventEnvelope::normalize(input)?;
        let envelope = self.schemas.annotate(envelope, None).await?;

        let inserted = self.events.insert_envelope(&envelope).await?;
        if !inserted {
            info!(event_id = %envelope.id, "duplicate event envelope id; record upserted");
        }

        let now = self.clock.now();
        let lag_ms = (now - envelope.occurred_at).num_milliseconds().max(0);

        if let Some(pause) = self
            .scheduler
            .find_source_pause(envelope.source.as_str(), now)
            .await?
        {
            return self
                .park_envelope(&envelope, 1, Some(pause.until), pause.reason.as_str(), lag_ms)
                .await;
        }

        if let Some(limit) = self.rate_limit_for(envelope.source.as_str())
            && let RateLimitDecision::Paused { until, reason } =
                self.scheduler.record_source_event(&limit, now).await?
        {
            return self
                .park_envelope(&envelope, 1, Some(until), reason.as_str(), lag_ms)
                .await;
        }

        match self.enqueue_trigger_evaluation(envelope.id.as_str()).await {
            Ok(()) => {
                self.scheduler
                    .record_source_metrics(
                        envelope.source.as_str(),
                        SourceMetricsUpdate {
                            lag_ms: Some(lag_ms),
                            ..SourceMetricsUpdate::default()
                        },
                        now,
                    )
                    .await?;

                Ok(IngestOutcome::Accepted { envelope })
            }
            Err(error) if error.is_retryable() => {
                warn!(
                    event_id = %envelope.id,
                    error = %error,
                    "transient queue error during ingress; scheduling retry"
                );
                self.scheduler
                    .record_source_metrics(
                        envelope.source.as_str(),
                        SourceMetricsUpdate {
                            failure: true,
                            ..SourceMetricsUpdate::default()
                        },
                        now,
                    )
                    .await?;

                self.park_envelope(&envelope, 1, None, "queue_unavailable", lag_ms)
                    .await
            }
            Err(error) => Err(error),
        }
    }

    /// Processes one fired ingress retry job.
    ///
    /// Cancelled or missing retries drop silently; a still-paused source
    /// reschedules; otherwise retry state is deleted and the envelope hands
    /// off to trigger evaluation.
    pub async fn process_retry(&self, event_id: &str) -> AppResult<RetryOutcome> {
        let Some(retry) = self.events.find_ingress_retry(event_id).await? else {
            return Ok(RetryOutcome::Dropped);
        };

        if retry.cancelled {
            self.events.delete_ingress_retry(event_id).await?;
            return Ok(RetryOutcome::Dropped);
        }

        let Some(envelope) = self.events.find_envelope(event_id).await? else {
            warn!(event_id, "ingress retry references a missing envelope; dropping");
            self.events.delete_ingress_retry(event_id).await?;
            return Ok(RetryOutcome::Dropped);
        };

        let now = self.clock.now();

        if let Some(pause) = self
            .scheduler
            .find_source_pause(retry.source.as_str(), now)
            .await?
        {
            let attempts = retry.attempts + 1;
            if attempts > i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX) {
                warn!(
                    event_id,
                    source = %retry.source,
                    attempts,
                    "ingress retry attempts exhausted; dropping envelope"
                );
                self.scheduler
                    .record_source_metrics(
                        retry.source.as_str(),
                        SourceMetricsUpdate {
                            dropped: true,
                            ..SourceMetricsUpdate::default()
                        },
                        now,
                    )
                    .await?;
                self.events.delete_ingress_retry(event_id).await?;
                return Ok(RetryOutcome::Dropped);
            }

            let next_attempt_at = self
                .schedule_retry(&envelope, attempts, Some(pause.until), pause.reason.as_str())
                .await?;
            return Ok(RetryOutcome::Rescheduled { next_attempt_at });
        }

        self.events.delete_ingress_retry(event_id).await?;
        self.enqueue_trigger_evaluation(event_id).await?;
        Ok(RetryOutcome::Completed)
    }

    /// Cancels one pending ingress retry; the delayed job becomes a no-op.
    pub async fn cancel_retry(&self, event_id: &str) -> AppResult<bool> {
        self.events.cancel_ingress_retry(event_id).await
    }

    /// Pauses one source manually.
    pub async fn pause_source(
        &self,
        actor: &str,
        source: &str,
        until: DateTime<Utc>,
        reason: &str,
        details: Option<Value>,
    ) -> AppResult<()> {
        self.scheduler
            .pause_source(SourcePauseState {
                source: source.to_owned(),
                until,
                reason: reason.to_owned(),
                manual: true,
                details,
            })
            .await?;

        self.audit
            .append_event(AuditEvent {
                actor: actor.to_owned(),
                action: AuditAction::EventSourcePaused,
                resource_type: "event_source".to_owned(),
                resource_id: source.to_owned(),
                detail: Some(format!("paused until {until} ({reason})")),
            })
            .await
    }

    /// Lifts any pause on one source.
    pub async fn resume_source(&self, actor: &str, source: &str) -> AppResult<()> {
        self.scheduler.resume_source(source).await?;

        self.audit
            .append_event(AuditEvent {
                actor: actor.to_owned(),
                action: AuditAction::EventSourceResumed,
                resource_type: "event_source".to_owned(),
                resource_id: source.to_owned(),
                detail: None,
            })
            .await
    }

    /// Returns aggregate ingress counters for one source.
    pub async fn source_metrics(&self, source: &str) -> AppResult<Option<SourceMetrics>> {
        self.scheduler.source_metrics(source).await
    }

    fn rate_limit_for(&self, source: &str) -> Option<SourceRateLimit> {
        self.config
            .rate_limits
            .iter()
            .find(|limit| limit.source == source)
            .cloned()
    }

    async fn park_envelope(
        &self,
        envelope: &EventEnvelope,
        attempts: i32,
        resume_at: Option<DateTime<Utc>>,
        reason: &str,
        lag_ms: i64,
    ) -> AppResult<IngestOutcome> {
        let next_attempt_at = self.schedule_retry(envelope, attempts, resume_at, reason).await?;

        self.scheduler
            .record_source_metrics(
                envelope.source.as_str(),
                SourceMetricsUpdate {
                    throttled: true,
                    lag_ms: Some(lag_ms),
                    ..SourceMetricsUpdate::default()
                },
                self.clock.now(),
            )
            .await?;

        Ok(IngestOutcome::Scheduled {
            envelope: envelope.clone(),
            next_attempt_at,
            attempts,
        })
    }

    async fn schedule_retry(
        &self,
        envelope: &EventEnvelope,
        attempts: i32,
        resume_at: Option<DateTime<Utc>>,
        reason: &str,
    ) -> AppResult<DateTime<Utc>> {
        let now = self.clock.now();
        let backoff_ms = self
            .config
            .retry_backoff
            .delay_ms_for_attempt(u32::try_from(attempts).unwrap_or(1), &mut rand::thread_rng());
        let mut next_attempt_at =
            now + chrono::Duration::milliseconds(i64::try_from(backoff_ms).unwrap_or(i64::MAX));
        if let Some(resume_at) = resume_at
            && resume_at > next_attempt_at
        {
            next_attempt_at = resume_at;
        }

        self.events
            .upsert_ingress_retry(&IngressRetry {
                event_id: envelope.id.clone(),
                source: envelope.source.clone(),
                attempts,
                next_attempt_at,
                reason: reason.to_owned(),
                cancelled: false,
            })
            .await?;

        let disposition = self
            .queue
            .enqueue(
                QueueKey::Event,
                QueueJob::delayed(
                    JOB_EVENT_INGRESS_RETRY,
                    Some(scheduled_job_id([JOB_EVENT_INGRESS_RETRY, envelope.id.as_str()])),
                    json!({"eventId": envelope.id}),
                    next_attempt_at,
                ),
            )
            .await?;

        if disposition == EnqueueDisposition::Duplicate {
            info!(event_id = %envelope.id, "ingress retry job already scheduled");
        }

        Ok(next_attempt_at)
    }

    async fn enqueue_trigger_evaluation(&self, event_id: &str) -> AppResult<()> {
        self.queue
            .enqueue(
                QueueKey::EventTrigger,
                QueueJob::immediate(
                    JOB_TRIGGER_EVALUATE,
                    Some(scheduled_job_id([JOB_TRIGGER_EVALUATE, event_id])),
                    json!({"eventId": event_id}),
                ),
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests;
