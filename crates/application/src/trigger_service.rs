//! Trigger evaluation: match persisted envelopes to triggers and launch
//! workflow runs.

use std::sync::Arc;

use apphub_core::run_key::scheduled_job_id;
use apphub_core::{AppError, AppResult, Clock, truncate_error_message};
use apphub_domain::{BackoffConfig, EventEnvelope, EventTrigger, envelope_scope, resolve_template_value};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit_ports::{AuditAction, AuditEvent, AuditRepository};
use crate::event_ports::{EventStore, TriggerStore};
use crate::queue_ports::{JOB_TRIGGER_RETRY, JobQueue, QueueJob, QueueKey};
use crate::scheduler_ports::{SchedulerStateStore, TriggerMetricKind, TriggerMetrics};
use crate::workflow_ports::{CreateWorkflowRunInput, WorkflowRunTrigger};
use crate::workflow_service::WorkflowService;

/// Trigger evaluation knobs, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct TriggerEvaluatorConfig {
    /// Failures inside the window that pause the trigger.
    pub error_threshold: i64,
    /// Rolling failure window length.
    pub error_window_ms: i64,
    /// Pause applied when the threshold is crossed.
    pub trigger_pause_ms: i64,
    /// Evaluation attempts per `(event, trigger)` pair.
    pub retry_attempts: u32,
    /// Backoff applied to evaluation retries.
    pub retry_backoff: BackoffConfig,
}

impl Default for TriggerEvaluatorConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            error_window_ms: 60_000,
            trigger_pause_ms: 300_000,
            retry_attempts: 5,
            retry_backoff: BackoffConfig::default(),
        }
    }
}

/// Decision recorded for one `(envelope, trigger)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    /// A run was launched (or an existing keyed run re-enqueued).
    Launched {
        /// Launched run identifier.
        run_id: apphub_core::RunId,
        /// Whether a new run row was created.
        created: bool,
    },
    /// The filter predicate rejected the envelope.
    Filtered,
    /// The throttle rejected the launch.
    Throttled,
    /// The trigger is paused.
    Paused,
    /// The trigger is disabled.
    Skipped,
    /// Evaluation failed.
    Failed {
        /// Failure detail.
        error: String,
        /// Whether a retry was scheduled.
        retry_scheduled: bool,
    },
}

/// Outcome of evaluating one trigger against one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvaluation {
    /// Evaluated trigger.
    pub trigger_id: Uuid,
    /// Decision taken.
    pub decision: TriggerDecision,
}

/// Evaluator matching envelopes to triggers.
#[derive(Clone)]
pub struct TriggerEvaluator {
    triggers: Arc<dyn TriggerStore>,
    events: Arc<dyn EventStore>,
    scheduler: Arc<dyn SchedulerStateStore>,
    workflows: WorkflowService,
    queue: Arc<dyn JobQueue>,
    audit: Arc<dyn AuditRepository>,
    clock: Arc<dyn Clock>,
    config: TriggerEvaluatorConfig,
}

impl TriggerEvaluator {
    /// Creates a trigger evaluator.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        triggers: Arc<dyn TriggerStore>,
        events: Arc<dyn EventStore>,
        scheduler: Arc<dyn SchedulerStateStore>,
        workflows: WorkflowService,
        queue: Arc<dyn JobQueue>,
        audit: Arc<dyn AuditRepository>,
        clock: Arc<dyn Clock>,
        config: TriggerEvaluatorConfig,
    ) -> Self {
        Self {
            triggers,
            events,
            scheduler,
            workflows,
            queue,
            audit,
            clock,
            config,
        }
    }

    /// Evaluates every trigger listening for one persisted envelope.
    pub async fn evaluate_event(&self, event_id: &str) -> AppResult<Vec<TriggerEvaluation>> {
        let Some(envelope) = self.events.find_envelope(event_id).await? else {
            return Err(AppError::NotFound(format!(
                "event envelope '{event_id}' not found"
            )));
        };

        let triggers = self
            .triggers
            .list_triggers_for_event(envelope.event_type.as_str())
            .await?;

        let mut evaluations = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            let decision = self.evaluate_trigger(&envelope, trigger, 1).await?;
            evaluations.push(TriggerEvaluation {
                trigger_id: trigger.id,
                decision,
            });
        }

        Ok(evaluations)
    }

    /// Re-evaluates one trigger after a failed attempt.
    pub async fn evaluate_trigger_retry(
        &self,
        event_id: &str,
        trigger_id: Uuid,
        attempts: u32,
    ) -> AppResult<TriggerEvaluation> {
        let Some(envelope) = self.events.find_envelope(event_id).await? else {
            return Err(AppError::NotFound(format!(
                "event envelope '{event_id}' not found"
            )));
        };

        let Some(trigger) = self.triggers.find_trigger(trigger_id).await? else {
            info!(%trigger_id, "trigger deleted before retry; dropping");
            return Ok(TriggerEvaluation {
                trigger_id,
                decision: TriggerDecision::Skipped,
            });
        };

        let decision = self.evaluate_trigger(&envelope, &trigger, attempts).await?;
        Ok(TriggerEvaluation {
            trigger_id,
            decision,
        })
    }

    /// Returns aggregate counters for one trigger.
    pub async fn trigger_metrics(&self, trigger_id: Uuid) -> AppResult<Option<TriggerMetrics>> {
        self.scheduler.trigger_metrics(trigger_id).await
    }

    async fn evaluate_trigger(
        &self,
        envelope: &EventEnvelope,
        trigger: &EventTrigger,
        attempts: u32,
    ) -> AppResult<TriggerDecision> {
        let now = self.clock.now();

        if !trigger.is_enabled {
            self.scheduler
                .record_trigger_metric(trigger.id, TriggerMetricKind::Skipped, None)
                .await?;
            return Ok(TriggerDecision::Skipped);
        }

        if self.scheduler.find_trigger_pause(trigger.id, now).await?.is_some() {
            self.scheduler
                .record_trigger_metric(trigger.id, TriggerMetricKind::Paused, None)
                .await?;
            return Ok(TriggerDecision::Paused);
        }

        let scope = envelope_scope(envelope);
        if !trigger.predicate.matches(&scope) {
            self.scheduler
                .record_trigger_metric(trigger.id, TriggerMetricKind::Filtered, None)
                .await?;
            return Ok(TriggerDecision::Filtered);
        }

        self.scheduler
            .record_trigger_metric(trigger.id, TriggerMetricKind::Matched, None)
            .await?;

        if let Some(throttle) = &trigger.throttle {
            let allowed = self
                .scheduler
                .record_trigger_launch(trigger.id, throttle.window_ms, throttle.max_count, now)
                .await?;
            if !allowed {
                self.scheduler
                    .record_trigger_metric(trigger.id, TriggerMetricKind::Throttled, None)
                    .await?;
                return Ok(TriggerDecision::Throttled);
            }
        }

        match self.launch_run(envelope, trigger, &scope).await {
            Ok((run_id, created)) => {
                self.scheduler
                    .record_trigger_metric(trigger.id, TriggerMetricKind::Launched, None)
                    .await?;
                self.scheduler.clear_trigger_failures(trigger.id).await?;
                Ok(TriggerDecision::Launched { run_id, created })
            }
            Err(error) => {
                let message = truncate_error_message(error.to_string().as_str());
                warn!(
                    trigger_id = %trigger.id,
                    event_id = %envelope.id,
                    error = %error,
                    "trigger evaluation failed"
                );

                self.scheduler
                    .record_trigger_metric(
                        trigger.id,
                        TriggerMetricKind::Failed,
                        Some(message.as_str()),
                    )
                    .await?;

                let failure = self
                    .scheduler
                    .record_trigger_failure(
                        trigger.id,
                        self.config.error_window_ms,
                        self.config.error_threshold,
                        self.config.trigger_pause_ms,
                        now,
                    )
                    .await?;

                if let Some(paused_until) = failure.paused_until {
                    self.audit
                        .append_event(AuditEvent {
                            actor: "worker:event-trigger".to_owned(),
                            action: AuditAction::EventTriggerPaused,
                            resource_type: "event_trigger".to_owned(),
                            resource_id: trigger.id.to_string(),
                            detail: Some(format!(
                                "paused until {paused_until} after {} failures",
                                failure.failures
                            )),
                        })
                        .await?;
                }

                let retry_scheduled = attempts < self.config.retry_attempts;
                if retry_scheduled {
                    self.schedule_retry(envelope.id.as_str(), trigger.id, attempts).await?;
                }

                Ok(TriggerDecision::Failed {
                    error: message,
                    retry_scheduled,
                })
            }
        }
    }

    async fn launch_run(
        &self,
        envelope: &EventEnvelope,
        trigger: &EventTrigger,
        scope: &Value,
    ) -> AppResult<(apphub_core::RunId, bool)> {
        let parameters = if trigger.parameter_template.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            resolve_template_value(&trigger.parameter_template, scope)?
        };

        let run_key = trigger
            .run_key_template
            .as_ref()
            .map(|template| {
                resolve_template_value(&Value::String(template.clone()), scope).map(|resolved| {
                    match resolved {
                        Value::String(text) => text,
                        other => other.to_string(),
                    }
                })
            })
            .transpose()?
            .filter(|run_key| !run_key.trim().is_empty());

        let outcome = self
            .workflows
            .create_and_enqueue_run(CreateWorkflowRunInput {
                workflow_definition_id: trigger.workflow_definition_id,
                run_key,
                parameters,
                trigger: WorkflowRunTrigger {
                    trigger_type: "event".to_owned(),
                    payload: json!({
                        "eventId": envelope.id,
                        "eventType": envelope.event_type,
                        "source": envelope.source,
                        "triggerId": trigger.id.to_string(),
                        "correlationId": envelope.correlation_id,
                    }),
                },
                triggered_by: Some(format!("event-trigger:{}", trigger.id)),
                partition_key: None,
            })
            .await?;

        Ok((outcome.run().id, outcome.is_created()))
    }

    async fn schedule_retry(
        &self,
        event_id: &str,
        trigger_id: Uuid,
        attempts: u32,
    ) -> AppResult<()> {
        let delay_ms = self
            .config
            .retry_backoff
            .delay_ms_for_attempt(attempts, &mut rand::thread_rng());
        let run_at = self.clock.now()
            + chrono::Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX));

        self.queue
            .enqueue(
                QueueKey::EventTrigger,
                QueueJob::delayed(
                    JOB_TRIGGER_RETRY,
                    Some(scheduled_job_id([
                        JOB_TRIGGER_RETRY,
                        event_id,
                        trigger_id.to_string().as_str(),
                    ])),
                    json!({
                        "eventId": event_id,
                        "triggerId": trigger_id.to_string(),
                        "attempts": attempts + 1,
                    }),
                    run_at,
                ),
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests;
