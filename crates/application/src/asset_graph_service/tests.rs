use std::sync::Arc;

use apphub_core::{ManualClock, RunId, WorkflowId};
use apphub_domain::{
    AssetConsumption, AssetDeclaration, WorkflowDefinition, WorkflowDefinitionInput, WorkflowStep,
    WorkflowStepKind,
};
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use crate::event_bus::CoreEvent;
use crate::test_support::Fakes;
use crate::workflow_ports::{WorkflowRunStepAsset, WorkflowStore as _};

use super::AssetGraphService;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).single().unwrap_or_else(Utc::now),
    ))
}

fn service(fakes: &Fakes, clock: Arc<ManualClock>) -> AssetGraphService {
    AssetGraphService::new(fakes.workflow_store.clone(), fakes.bus.clone(), clock)
}

fn pipeline_step(produces: &str, consumes: Option<&str>) -> WorkflowStep {
    WorkflowStep {
        id: "build".to_owned(),
        name: "build".to_owned(),
        depends_on: Vec::new(),
        retry_policy: None,
        timeout_ms: None,
        produces: vec![AssetDeclaration {
            asset_id: produces.to_owned(),
            schema: None,
            freshness: None,
            partitioning: None,
            auto_materialize: None,
        }],
        consumes: consumes
            .map(|asset_id| {
                vec![AssetConsumption {
                    asset_id: asset_id.to_owned(),
                }]
            })
            .unwrap_or_default(),
        kind: WorkflowStepKind::Job {
            job_slug: "build".to_owned(),
            parameters: Value::Null,
            store_result_as: None,
        },
    }
}

async fn seed_definition(fakes: &Fakes, slug: &str, step: WorkflowStep) -> WorkflowDefinition {
    let definition = WorkflowDefinition::new(WorkflowDefinitionInput {
        slug: slug.to_owned(),
        name: slug.to_owned(),
        version: 1,
        steps: vec![step],
        default_parameters: json!({}),
        triggers: Vec::new(),
    });
    let Ok(definition) = definition else {
        panic!("definition '{slug}' must build");
    };

    let inserted = fakes.workflow_store.insert_definition(&definition).await;
    assert!(inserted.is_ok());
    definition
}

async fn record_materialization(
    fakes: &Fakes,
    workflow_id: WorkflowId,
    asset_id: &str,
    produced_at: chrono::DateTime<chrono::Utc>,
) {
    let recorded = fakes
        .workflow_store
        .record_step_asset(&WorkflowRunStepAsset {
            run_id: RunId::new(),
            workflow_definition_id: workflow_id,
            step_id: "build".to_owned(),
            asset_id: asset_id.to_owned(),
            asset_id_normalized: asset_id.to_owned(),
            partition_key: None,
            partition_key_normalized: String::new(),
            produced_at,
            payload: json!({}),
            schema: None,
            freshness: None,
        })
        .await;
    assert!(recorded.is_ok());
}

#[tokio::test]
async fn graph_collects_producers_consumers_and_edges() {
    let fakes = Fakes::default();
    let upstream = seed_definition(&fakes, "raw-loader", pipeline_step("a.raw", None)).await;
    let downstream =
        seed_definition(&fakes, "cleaner", pipeline_step("a.clean", Some("a.raw"))).await;

    let graph = service(&fakes, clock()).build().await;
    let Ok(graph) = graph else { panic!("graph must build") };

    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.edges.len(), 1);
    assert_eq!(graph.edges[0].from_asset_id, "a.raw");
    assert_eq!(graph.edges[0].to_asset_id, "a.clean");
    assert_eq!(graph.edges[0].workflow_definition_id, downstream.id());

    let raw = graph.nodes.iter().find(|node| node.asset_id == "a.raw");
    let Some(raw) = raw else { panic!("a.raw node must exist") };
    assert_eq!(raw.producers.len(), 1);
    assert_eq!(raw.producers[0].workflow_definition_id, upstream.id());
    assert_eq!(raw.consumers.len(), 1);
}

#[tokio::test]
async fn newer_upstreams_mark_downstream_assets_outdated() {
    let fakes = Fakes::default();
    let clock = clock();
    let upstream = seed_definition(&fakes, "raw-loader", pipeline_step("a.raw", None)).await;
    let downstream =
        seed_definition(&fakes, "cleaner", pipeline_step("a.clean", Some("a.raw"))).await;

    let older = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
    let newer = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).single().unwrap_or_else(Utc::now);
    record_materialization(&fakes, downstream.id(), "a.clean", older).await;
    record_materialization(&fakes, upstream.id(), "a.raw", newer).await;

    let graph = service(&fakes, clock).build().await;
    let Ok(graph) = graph else { panic!("graph must build") };

    let clean = graph.nodes.iter().find(|node| node.asset_id == "a.clean");
    let Some(clean) = clean else { panic!("a.clean node must exist") };
    assert!(clean.has_outdated_upstreams);
    assert_eq!(clean.outdated_upstream_asset_ids, vec!["a.raw".to_owned()]);

    let raw = graph.nodes.iter().find(|node| node.asset_id == "a.raw");
    let Some(raw) = raw else { panic!("a.raw node must exist") };
    assert!(!raw.has_outdated_upstreams);
}

#[tokio::test]
async fn marking_a_partition_stale_sets_the_flag_and_publishes_expiry() {
    let fakes = Fakes::default();
    let producer = seed_definition(&fakes, "raw-loader", pipeline_step("a.raw", None)).await;
    let service = service(&fakes, clock());

    let marked = service
        .mark_partition_stale(
            "operator:sre",
            producer.id(),
            "A.Raw",
            None,
            Some("backfill requested".to_owned()),
        )
        .await;
    assert!(marked.is_ok());

    let graph = service.build().await;
    let Ok(graph) = graph else { panic!("graph must build") };
    let raw = graph.nodes.iter().find(|node| node.asset_id == "a.raw");
    let Some(raw) = raw else { panic!("a.raw node must exist") };
    assert!(raw.has_stale_partitions);

    let published = fakes.bus.published.lock().await;
    assert!(published.iter().any(|event| matches!(
        event,
        CoreEvent::AssetExpired(notice) if notice.reason == "manual" && notice.asset_id == "a.raw"
    )));

    drop(published);
    let cleared = service.clear_partition_stale(producer.id(), "a.raw", None).await;
    assert!(cleared.is_ok());

    let graph = service.build().await;
    let Ok(graph) = graph else { panic!("graph must build") };
    let raw = graph.nodes.iter().find(|node| node.asset_id == "a.raw");
    let Some(raw) = raw else { panic!("a.raw node must exist") };
    assert!(!raw.has_stale_partitions);
}
