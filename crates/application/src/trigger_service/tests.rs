use std::sync::Arc;

use apphub_core::{Clock, ManualClock, WorkflowId};
use apphub_domain::{
    EventEnvelope, EventEnvelopeInput, EventTrigger, EventTriggerInput, TriggerCondition,
    TriggerConditionOperator, TriggerPredicate, TriggerThrottle, WorkflowStep, WorkflowStepKind,
};
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::event_ports::TriggerStore as _;
use crate::queue_ports::{JOB_TRIGGER_RETRY, QueueKey};
use crate::scheduler_ports::SchedulerStateStore as _;
use crate::test_support::Fakes;
use crate::workflow_ports::WorkflowRunStatus;
use crate::workflow_service::{WorkflowService, WorkflowServiceDeps};

use super::{TriggerDecision, TriggerEvaluator, TriggerEvaluatorConfig};

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now),
    ))
}

fn workflows(fakes: &Fakes, clock: Arc<ManualClock>) -> WorkflowService {
    WorkflowService::new(WorkflowServiceDeps {
        store: fakes.workflow_store.clone(),
        triggers: fakes.trigger_store.clone(),
        job_runtime: fakes.job_runtime.clone(),
        services: fakes.services.clone(),
        invoker: fakes.invoker.clone(),
        secrets: Arc::new(crate::test_support::FakeSecretResolver::default()),
        queue: fakes.queue.clone(),
        bus: fakes.bus.clone(),
        audit: fakes.audit.clone(),
        clock,
    })
}

fn evaluator(
    fakes: &Fakes,
    clock: Arc<ManualClock>,
    config: TriggerEvaluatorConfig,
) -> TriggerEvaluator {
    TriggerEvaluator::new(
        fakes.trigger_store.clone(),
        fakes.event_store.clone(),
        fakes.scheduler.clone(),
        workflows(fakes, clock.clone()),
        fakes.queue.clone(),
        fakes.audit.clone(),
        clock,
        config,
    )
}

async fn seed_workflow(fakes: &Fakes, clock: Arc<ManualClock>) -> WorkflowId {
    let service = workflows(fakes, clock);
    let created = service
        .create_definition(
            "tester",
            apphub_domain::WorkflowDefinitionInput {
                slug: "orders-pipeline".to_owned(),
                name: "Orders".to_owned(),
                version: 1,
                steps: vec![WorkflowStep {
                    id: "load".to_owned(),
                    name: "load".to_owned(),
                    depends_on: Vec::new(),
                    retry_policy: None,
                    timeout_ms: None,
                    produces: Vec::new(),
                    consumes: Vec::new(),
                    kind: WorkflowStepKind::Job {
                        job_slug: "load-order".to_owned(),
                        parameters: Value::Null,
                        store_result_as: None,
                    },
                }],
                default_parameters: json!({}),
                triggers: Vec::new(),
            },
        )
        .await;

    let Ok(created) = created else {
        panic!("workflow must create");
    };
    created.id()
}

async fn seed_trigger(
    fakes: &Fakes,
    workflow_id: WorkflowId,
    input: EventTriggerInput,
) -> EventTrigger {
    let trigger = EventTrigger::new(workflow_id, input);
    let Ok(trigger) = trigger else {
        panic!("trigger must build");
    };

    fakes
        .trigger_store
        .triggers
        .lock()
        .await
        .insert(trigger.id, trigger.clone());
    trigger
}

fn order_trigger_input() -> EventTriggerInput {
    EventTriggerInput {
        event_type: "orders.created".to_owned(),
        predicate: TriggerPredicate::default(),
        parameter_template: json!({"orderId": "{{ payload.orderId }}"}),
        run_key_template: None,
        throttle: None,
    }
}

async fn seed_envelope(fakes: &Fakes, id: &str, payload: Value) {
    let envelope = EventEnvelope::normalize(EventEnvelopeInput {
        id: id.to_owned(),
        event_type: "orders.created".to_owned(),
        source: "shop".to_owned(),
        occurred_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now),
        payload,
        correlation_id: None,
        ttl_ms: None,
        metadata: None,
        schema_version: None,
        schema_hash: None,
    });
    let Ok(envelope) = envelope else {
        panic!("envelope must normalize");
    };

    fakes
        .event_store
        .envelopes
        .lock()
        .await
        .insert(envelope.id.clone(), envelope);
}

#[tokio::test]
async fn matching_envelope_launches_a_pending_run_with_mapped_parameters() {
    let fakes = Fakes::default();
    let clock = clock();
    let workflow_id = seed_workflow(&fakes, clock.clone()).await;
    let trigger = seed_trigger(&fakes, workflow_id, order_trigger_input()).await;
    seed_envelope(&fakes, "e1", json!({"orderId": "o-1"})).await;

    let evaluator = evaluator(&fakes, clock, TriggerEvaluatorConfig::default());
    let evaluations = evaluator.evaluate_event("e1").await;

    let Ok(evaluations) = evaluations else {
        panic!("evaluation must pass");
    };
    assert_eq!(evaluations.len(), 1);
    let TriggerDecision::Launched { run_id, created } = &evaluations[0].decision else {
        panic!("trigger must launch");
    };
    assert!(*created);

    let run = fakes.workflow_store.runs.lock().await.get(run_id).cloned();
    let Some(run) = run else { panic!("run must persist") };
    assert_eq!(run.status, WorkflowRunStatus::Pending);
    assert_eq!(run.parameters, json!({"orderId": "o-1"}));
    assert_eq!(run.trigger.trigger_type, "event");

    let metrics = evaluator.trigger_metrics(trigger.id).await;
    let Ok(Some(metrics)) = metrics else {
        panic!("trigger metrics must exist");
    };
    assert_eq!(metrics.matched, 1);
    assert_eq!(metrics.launched, 1);
}

#[tokio::test]
async fn non_matching_envelopes_are_filtered() {
    let fakes = Fakes::default();
    let clock = clock();
    let workflow_id = seed_workflow(&fakes, clock.clone()).await;
    let trigger = seed_trigger(
        &fakes,
        workflow_id,
        EventTriggerInput {
            predicate: TriggerPredicate {
                conditions: vec![TriggerCondition {
                    path: "payload.region".to_owned(),
                    operator: TriggerConditionOperator::Equals,
                    value: Some(json!("eu")),
                }],
            },
            ..order_trigger_input()
        },
    )
    .await;
    seed_envelope(&fakes, "e1", json!({"orderId": "o-1", "region": "us"})).await;

    let evaluator = evaluator(&fakes, clock, TriggerEvaluatorConfig::default());
    let evaluations = evaluator.evaluate_event("e1").await;

    let Ok(evaluations) = evaluations else {
        panic!("evaluation must pass");
    };
    assert_eq!(evaluations[0].decision, TriggerDecision::Filtered);
    assert!(fakes.workflow_store.runs.lock().await.is_empty());

    let metrics = evaluator.trigger_metrics(trigger.id).await;
    assert_eq!(metrics.ok().flatten().map(|metrics| metrics.filtered), Some(1));
}

#[tokio::test]
async fn throttled_triggers_skip_the_launch() {
    let fakes = Fakes::default();
    let clock = clock();
    let workflow_id = seed_workflow(&fakes, clock.clone()).await;
    seed_trigger(
        &fakes,
        workflow_id,
        EventTriggerInput {
            throttle: Some(TriggerThrottle {
                window_ms: 60_000,
                max_count: 1,
                max_concurrency: None,
            }),
            ..order_trigger_input()
        },
    )
    .await;
    seed_envelope(&fakes, "e1", json!({"orderId": "o-1"})).await;
    seed_envelope(&fakes, "e2", json!({"orderId": "o-2"})).await;

    let evaluator = evaluator(&fakes, clock, TriggerEvaluatorConfig::default());
    let first = evaluator.evaluate_event("e1").await;
    let second = evaluator.evaluate_event("e2").await;

    let Ok(first) = first else { panic!("first evaluation must pass") };
    let Ok(second) = second else { panic!("second evaluation must pass") };
    assert!(matches!(first[0].decision, TriggerDecision::Launched { .. }));
    assert_eq!(second[0].decision, TriggerDecision::Throttled);
    assert_eq!(fakes.workflow_store.runs.lock().await.len(), 1);
}

#[tokio::test]
async fn repeated_failures_pause_the_trigger_and_schedule_retries() {
    let fakes = Fakes::default();
    let clock = clock();
    // The trigger points at a missing workflow, so every launch fails.
    let trigger = seed_trigger(&fakes, WorkflowId::new(), order_trigger_input()).await;
    seed_envelope(&fakes, "e1", json!({"orderId": "o-1"})).await;
    seed_envelope(&fakes, "e2", json!({"orderId": "o-2"})).await;
    seed_envelope(&fakes, "e3", json!({"orderId": "o-3"})).await;

    let evaluator = evaluator(
        &fakes,
        clock,
        TriggerEvaluatorConfig {
            error_threshold: 2,
            ..TriggerEvaluatorConfig::default()
        },
    );

    let first = evaluator.evaluate_event("e1").await;
    let Ok(first) = first else { panic!("first evaluation must pass") };
    assert!(matches!(
        first[0].decision,
        TriggerDecision::Failed { retry_scheduled: true, .. }
    ));

    let retry_jobs = fakes.queue.jobs_for(QueueKey::EventTrigger).await;
    assert!(retry_jobs.iter().any(|job| job.name == JOB_TRIGGER_RETRY));

    let second = evaluator.evaluate_event("e2").await;
    let Ok(second) = second else { panic!("second evaluation must pass") };
    assert!(matches!(second[0].decision, TriggerDecision::Failed { .. }));

    // Threshold crossed: the third envelope sees a paused trigger.
    let third = evaluator.evaluate_event("e3").await;
    let Ok(third) = third else { panic!("third evaluation must pass") };
    assert_eq!(third[0].decision, TriggerDecision::Paused);

    let metrics = evaluator.trigger_metrics(trigger.id).await;
    let Ok(Some(metrics)) = metrics else {
        panic!("trigger metrics must exist");
    };
    assert_eq!(metrics.failed, 2);
    assert_eq!(metrics.paused, 1);

    let audit_events = fakes.audit.events.lock().await;
    assert!(!audit_events.is_empty());
}

#[tokio::test]
async fn a_success_clears_the_failure_window() {
    let fakes = Fakes::default();
    let clock = clock();
    let workflow_id = seed_workflow(&fakes, clock.clone()).await;
    let trigger = seed_trigger(&fakes, workflow_id, order_trigger_input()).await;
    seed_envelope(&fakes, "e1", json!({"orderId": "o-1"})).await;

    let evaluator = evaluator(
        &fakes,
        clock.clone(),
        TriggerEvaluatorConfig {
            error_threshold: 2,
            ..TriggerEvaluatorConfig::default()
        },
    );

    // One failure recorded directly against the window.
    let failure = fakes
        .scheduler
        .record_trigger_failure(trigger.id, 60_000, 2, 300_000, clock.now())
        .await;
    assert!(failure.is_ok());

    let evaluations = evaluator.evaluate_event("e1").await;
    let Ok(evaluations) = evaluations else {
        panic!("evaluation must pass");
    };
    assert!(matches!(evaluations[0].decision, TriggerDecision::Launched { .. }));

    // Another failure starts a fresh count instead of crossing the threshold.
    let failure = fakes
        .scheduler
        .record_trigger_failure(trigger.id, 60_000, 2, 300_000, clock.now())
        .await;
    assert_eq!(failure.ok().map(|decision| decision.failures), Some(1));
}

#[tokio::test]
async fn run_key_templates_deduplicate_launches_across_envelopes() {
    let fakes = Fakes::default();
    let clock = clock();
    let workflow_id = seed_workflow(&fakes, clock.clone()).await;
    seed_trigger(
        &fakes,
        workflow_id,
        EventTriggerInput {
            run_key_template: Some("order-{{ payload.orderId }}".to_owned()),
            ..order_trigger_input()
        },
    )
    .await;
    seed_envelope(&fakes, "e1", json!({"orderId": "o-1"})).await;
    seed_envelope(&fakes, "e2", json!({"orderId": "o-1"})).await;

    let evaluator = evaluator(&fakes, clock, TriggerEvaluatorConfig::default());
    let first = evaluator.evaluate_event("e1").await;
    let second = evaluator.evaluate_event("e2").await;

    let Ok(first) = first else { panic!("first evaluation must pass") };
    let Ok(second) = second else { panic!("second evaluation must pass") };

    let TriggerDecision::Launched { run_id: first_run, created: true } = &first[0].decision else {
        panic!("first envelope must create a run");
    };
    let TriggerDecision::Launched { run_id: second_run, created: false } = &second[0].decision
    else {
        panic!("second envelope must reuse the active run");
    };
    assert_eq!(first_run, second_run);
    assert_eq!(fakes.workflow_store.runs.lock().await.len(), 1);
}
