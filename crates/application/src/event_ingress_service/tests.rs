use std::sync::Arc;

use apphub_core::{AppError, Clock, ManualClock};
use apphub_domain::{BackoffConfig, EventEnvelopeInput};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use crate::event_ports::EventStore as _;
use crate::event_schema_service::EventSchemaRegistry;
use crate::queue_ports::{JOB_EVENT_INGRESS_RETRY, JOB_TRIGGER_EVALUATE, QueueKey};
use crate::scheduler_ports::SourceRateLimit;
use crate::test_support::Fakes;

use super::{EventIngressService, IngestOutcome, IngressConfig, RetryOutcome};

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).single().unwrap_or_else(Utc::now),
    ))
}

fn service(fakes: &Fakes, clock: Arc<ManualClock>, config: IngressConfig) -> EventIngressService {
    let registry = Arc::new(EventSchemaRegistry::new(
        Arc::new(crate::test_support::FakeSchemaStore::default()),
        clock.clone(),
        true,
    ));

    EventIngressService::new(
        registry,
        fakes.event_store.clone(),
        fakes.scheduler.clone(),
        fakes.queue.clone(),
        fakes.audit.clone(),
        clock,
        config,
    )
}

fn envelope_input(id: &str) -> EventEnvelopeInput {
    EventEnvelopeInput {
        id: id.to_owned(),
        event_type: "orders.created".to_owned(),
        source: "shop".to_owned(),
        occurred_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now),
        payload: json!({"orderId": "o-1"}),
        correlation_id: None,
        ttl_ms: None,
        metadata: None,
        schema_version: None,
        schema_hash: None,
    }
}

fn rate_limited_config() -> IngressConfig {
    IngressConfig {
        rate_limits: vec![SourceRateLimit {
            source: "shop".to_owned(),
            limit: 1,
            interval_ms: 60_000,
            pause_ms: 60_000,
        }],
        retry_backoff: BackoffConfig {
            base_ms: 1_000,
            factor: 2.0,
            max_ms: 60_000,
            jitter_ratio: 0.0,
        },
        max_attempts: 3,
    }
}

#[tokio::test]
async fn accepted_envelope_enqueues_trigger_evaluation_and_counts_metrics() {
    let fakes = Fakes::default();
    let service = service(&fakes, clock(), IngressConfig::default());

    let outcome = service.ingest(envelope_input("e1")).await;
    assert!(matches!(outcome, Ok(IngestOutcome::Accepted { .. })));

    let trigger_jobs = fakes.queue.jobs_for(QueueKey::EventTrigger).await;
    assert_eq!(trigger_jobs.len(), 1);
    assert_eq!(trigger_jobs[0].name, JOB_TRIGGER_EVALUATE);
    assert_eq!(trigger_jobs[0].payload, json!({"eventId": "e1"}));

    let metrics = service.source_metrics("shop").await;
    let Ok(Some(metrics)) = metrics else {
        panic!("source metrics must exist");
    };
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.throttled, 0);
    assert_eq!(metrics.last_lag_ms, 10_000);
}

#[tokio::test]
async fn second_envelope_from_rate_limited_source_parks_behind_a_retry() {
    let fakes = Fakes::default();
    let clock = clock();
    let service = service(&fakes, clock.clone(), rate_limited_config());

    let first = service.ingest(envelope_input("e1")).await;
    assert!(matches!(first, Ok(IngestOutcome::Accepted { .. })));

    clock.advance_ms(1_000);
    let second = service.ingest(envelope_input("e2")).await;
    let Ok(IngestOutcome::Scheduled {
        next_attempt_at,
        attempts,
        ..
    }) = second
    else {
        panic!("second envelope must be scheduled");
    };

    assert_eq!(attempts, 1);
    // The pause dominates the 1s backoff: the retry lands about a minute out.
    let delay = next_attempt_at - clock.now();
    assert!(delay >= Duration::seconds(59) && delay <= Duration::seconds(61));

    let retry = fakes.event_store.find_ingress_retry("e2").await;
    assert_eq!(retry.ok().flatten().map(|retry| retry.attempts), Some(1));

    let retry_jobs = fakes.queue.jobs_for(QueueKey::Event).await;
    assert_eq!(retry_jobs.len(), 1);
    assert_eq!(retry_jobs[0].name, JOB_EVENT_INGRESS_RETRY);
    assert!(retry_jobs[0].run_at.is_some());

    let metrics = service.source_metrics("shop").await;
    let Ok(Some(metrics)) = metrics else {
        panic!("source metrics must exist");
    };
    assert_eq!(metrics.throttled, 1);
}

#[tokio::test]
async fn manually_paused_source_parks_envelopes() {
    let fakes = Fakes::default();
    let clock = clock();
    let service = service(&fakes, clock.clone(), IngressConfig::default());

    let paused = service
        .pause_source(
            "operator:sre",
            "shop",
            clock.now() + Duration::minutes(10),
            "incident",
            None,
        )
        .await;
    assert!(paused.is_ok());

    let outcome = service.ingest(envelope_input("e1")).await;
    assert!(matches!(outcome, Ok(IngestOutcome::Scheduled { .. })));
    assert!(fakes.queue.jobs_for(QueueKey::EventTrigger).await.is_empty());

    let audit_events = fakes.audit.events.lock().await;
    assert_eq!(audit_events.len(), 1);
}

#[tokio::test]
async fn duplicate_envelope_ids_are_idempotent() {
    let fakes = Fakes::default();
    let service = service(&fakes, clock(), IngressConfig::default());

    let first = service.ingest(envelope_input("e1")).await;
    let second = service.ingest(envelope_input("e1")).await;
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(fakes.event_store.envelopes.lock().await.len(), 1);
}

#[tokio::test]
async fn validation_failures_abort_before_persisting() {
    let fakes = Fakes::default();
    let service = service(&fakes, clock(), IngressConfig::default());

    let mut invalid = envelope_input("e1");
    invalid.source = "  ".to_owned();

    let outcome = service.ingest(invalid).await;
    assert!(matches!(outcome, Err(AppError::Validation(_))));
    assert!(fakes.event_store.envelopes.lock().await.is_empty());
    assert!(fakes.queue.jobs_for(QueueKey::EventTrigger).await.is_empty());
}

#[tokio::test]
async fn transient_queue_errors_fall_back_to_a_scheduled_retry() {
    let fakes = Fakes::default();
    let service = service(&fakes, clock(), IngressConfig::default());

    fakes
        .queue
        .fail_next_enqueue(AppError::RetryableExternal("broker offline".to_owned()))
        .await;

    let outcome = service.ingest(envelope_input("e1")).await;
    assert!(matches!(outcome, Ok(IngestOutcome::Scheduled { .. })));

    let metrics = service.source_metrics("shop").await;
    let Ok(Some(metrics)) = metrics else {
        panic!("source metrics must exist");
    };
    assert_eq!(metrics.failures, 1);
    assert_eq!(metrics.throttled, 1);
}

#[tokio::test]
async fn cancelled_retries_drop_silently() {
    let fakes = Fakes::default();
    let clock = clock();
    let service = service(&fakes, clock.clone(), rate_limited_config());

    let accepted = service.ingest(envelope_input("e1")).await;
    assert!(accepted.is_ok());
    let scheduled = service.ingest(envelope_input("e2")).await;
    assert!(scheduled.is_ok());

    let cancelled = service.cancel_retry("e2").await;
    assert_eq!(cancelled.ok(), Some(true));

    let outcome = service.process_retry("e2").await;
    assert_eq!(outcome.ok(), Some(RetryOutcome::Dropped));
    assert!(fakes.event_store.retries.lock().await.is_empty());
}

#[tokio::test]
async fn retry_against_a_still_paused_source_reschedules() {
    let fakes = Fakes::default();
    let clock = clock();
    let service = service(&fakes, clock.clone(), rate_limited_config());

    let accepted = service.ingest(envelope_input("e1")).await;
    assert!(accepted.is_ok());
    let scheduled = service.ingest(envelope_input("e2")).await;
    assert!(scheduled.is_ok());

    // Pause is still active at +30s.
    clock.advance_ms(30_000);
    let outcome = service.process_retry("e2").await;
    assert!(matches!(outcome, Ok(RetryOutcome::Rescheduled { .. })));

    let retry = fakes.event_store.find_ingress_retry("e2").await;
    assert_eq!(retry.ok().flatten().map(|retry| retry.attempts), Some(2));
}

#[tokio::test]
async fn retry_after_pause_expiry_hands_off_to_trigger_evaluation() {
    let fakes = Fakes::default();
    let clock = clock();
    let service = service(&fakes, clock.clone(), rate_limited_config());

    let accepted = service.ingest(envelope_input("e1")).await;
    assert!(accepted.is_ok());
    let scheduled = service.ingest(envelope_input("e2")).await;
    assert!(scheduled.is_ok());

    clock.advance_ms(61_000);
    let outcome = service.process_retry("e2").await;
    assert_eq!(outcome.ok(), Some(RetryOutcome::Completed));
    assert!(fakes.event_store.retries.lock().await.is_empty());

    let trigger_jobs = fakes.queue.jobs_for(QueueKey::EventTrigger).await;
    assert_eq!(trigger_jobs.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_drop_the_envelope_with_a_metric() {
    let fakes = Fakes::default();
    let clock = clock();
    let mut config = rate_limited_config();
    config.max_attempts = 1;
    let service = service(&fakes, clock.clone(), config);

    let accepted = service.ingest(envelope_input("e1")).await;
    assert!(accepted.is_ok());
    let scheduled = service.ingest(envelope_input("e2")).await;
    assert!(scheduled.is_ok());

    clock.advance_ms(30_000);
    let outcome = service.process_retry("e2").await;
    assert_eq!(outcome.ok(), Some(RetryOutcome::Dropped));

    let metrics = service.source_metrics("shop").await;
    let Ok(Some(metrics)) = metrics else {
        panic!("source metrics must exist");
    };
    assert_eq!(metrics.dropped, 1);
}
