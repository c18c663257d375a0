use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use apphub_core::{AppError, AppResult, ManualClock};
use chrono::{TimeZone, Utc};
use tokio::sync::{Mutex, broadcast};

use crate::queue_ports::QueueKey;
use crate::scaling_ports::{
    ScalingAck, ScalingAckStatus, ScalingChannel, ScalingMessage, ScalingPolicy,
    ScalingPolicyStore, ScalingTargetConfig,
};
use crate::test_support::FakeAuditRepository;

use super::{ConcurrencyHandle, RuntimeScalingService, ScalingAgent};

#[derive(Default)]
struct FakeScalingStore {
    policies: Mutex<HashMap<QueueKey, ScalingPolicy>>,
    acks: Mutex<Vec<ScalingAck>>,
}

#[async_trait]
impl ScalingPolicyStore for FakeScalingStore {
    async fn find_policy(&self, target: QueueKey) -> AppResult<Option<ScalingPolicy>> {
        Ok(self.policies.lock().await.get(&target).cloned())
    }

    async fn upsert_policy(&self, policy: &ScalingPolicy) -> AppResult<()> {
        self.policies.lock().await.insert(policy.target, policy.clone());
        Ok(())
    }

    async fn record_ack(&self, ack: &ScalingAck) -> AppResult<()> {
        self.acks.lock().await.push(ack.clone());
        Ok(())
    }

    async fn list_acks(&self, target: QueueKey, limit: usize) -> AppResult<Vec<ScalingAck>> {
        Ok(self
            .acks
            .lock()
            .await
            .iter()
            .rev()
            .filter(|ack| ack.target == target)
            .take(limit)
            .cloned()
            .collect())
    }
}

struct FakeScalingChannel {
    sender: broadcast::Sender<ScalingMessage>,
}

impl Default for FakeScalingChannel {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }
}

#[async_trait]
impl ScalingChannel for FakeScalingChannel {
    async fn publish(&self, message: ScalingMessage) -> AppResult<()> {
        let _ = self.sender.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ScalingMessage> {
        self.sender.subscribe()
    }
}

struct RecordingHandle {
    applied: AtomicI32,
    applications: AtomicI32,
    fail: bool,
}

impl RecordingHandle {
    fn new() -> Self {
        Self {
            applied: AtomicI32::new(-1),
            applications: AtomicI32::new(0),
            fail: false,
        }
    }
}

#[async_trait]
impl ConcurrencyHandle for RecordingHandle {
    async fn apply(&self, concurrency: i32) -> AppResult<()> {
        if self.fail {
            return Err(AppError::Internal("cannot resize worker".to_owned()));
        }

        self.applied.store(concurrency, Ordering::SeqCst);
        self.applications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now),
    ))
}

fn targets() -> HashMap<QueueKey, ScalingTargetConfig> {
    HashMap::from([(
        QueueKey::Workflow,
        ScalingTargetConfig {
            min_concurrency: 0,
            max_concurrency: 16,
            default_concurrency: 4,
            rate_limit_ms: 10_000,
        },
    )])
}

fn service(
    store: Arc<FakeScalingStore>,
    channel: Arc<FakeScalingChannel>,
    clock: Arc<ManualClock>,
) -> RuntimeScalingService {
    let service = RuntimeScalingService::new(
        store,
        channel,
        Arc::new(FakeAuditRepository::default()),
        clock,
        targets(),
    );
    let Ok(service) = service else {
        panic!("scaling service must build");
    };
    service
}

#[tokio::test]
async fn updates_clamp_into_target_bounds_and_publish() {
    let store = Arc::new(FakeScalingStore::default());
    let channel = Arc::new(FakeScalingChannel::default());
    let mut messages = channel.subscribe();
    let service = service(store, channel, clock());

    let updated = service
        .update_policy("operator:sre", QueueKey::Workflow, 99, None)
        .await;
    assert_eq!(updated.ok().map(|policy| policy.desired_concurrency), Some(16));

    let message = messages.try_recv();
    assert!(matches!(
        message,
        Ok(ScalingMessage::PolicyUpdate { desired_concurrency: 16, .. })
    ));
}

#[tokio::test]
async fn value_changing_updates_inside_the_rate_limit_are_rejected() {
    let store = Arc::new(FakeScalingStore::default());
    let channel = Arc::new(FakeScalingChannel::default());
    let clock = clock();
    let service = service(store, channel, clock.clone());

    let first = service.update_policy("operator:sre", QueueKey::Workflow, 8, None).await;
    assert!(first.is_ok());

    clock.advance_ms(2_000);
    let second = service.update_policy("operator:sre", QueueKey::Workflow, 2, None).await;
    let Err(AppError::RateLimited { retry_after_ms, .. }) = second else {
        panic!("second update must be rate limited");
    };
    assert_eq!(retry_after_ms, Some(8_000));

    // Re-asserting the same value is not rate limited.
    let same = service.update_policy("operator:sre", QueueKey::Workflow, 8, None).await;
    assert!(same.is_ok());

    clock.advance_ms(8_001);
    let third = service.update_policy("operator:sre", QueueKey::Workflow, 2, None).await;
    assert_eq!(third.ok().map(|policy| policy.desired_concurrency), Some(2));
}

#[tokio::test]
async fn snapshot_falls_back_to_the_default_concurrency() {
    let store = Arc::new(FakeScalingStore::default());
    let channel = Arc::new(FakeScalingChannel::default());
    let service = service(store, channel, clock());

    let snapshot = service.snapshot(QueueKey::Workflow).await;
    let Ok(snapshot) = snapshot else {
        panic!("snapshot must pass");
    };
    assert_eq!(snapshot.desired_concurrency, 4);
    assert_eq!(snapshot.updated_at, None);
}

#[tokio::test]
async fn agent_applies_the_snapshot_and_records_an_ack() {
    let store = Arc::new(FakeScalingStore::default());
    let channel = Arc::new(FakeScalingChannel::default());
    let clock = clock();
    let service = service(store.clone(), channel, clock);
    let handle = Arc::new(RecordingHandle::new());

    let mut agent = ScalingAgent::new(
        service,
        QueueKey::Workflow,
        "worker-1".to_owned(),
        handle.clone(),
    );

    let applied = agent.refresh_and_apply().await;
    assert_eq!(applied.ok(), Some(4));
    assert_eq!(handle.applied.load(Ordering::SeqCst), 4);

    let acks = store.acks.lock().await;
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].status, ScalingAckStatus::Applied);
    assert_eq!(acks[0].applied_concurrency, 4);
    assert_eq!(acks[0].instance_id, "worker-1");
}

#[tokio::test]
async fn zero_concurrency_pauses_but_keeps_the_worker_registered() {
    let store = Arc::new(FakeScalingStore::default());
    let channel = Arc::new(FakeScalingChannel::default());
    let clock = clock();
    let service = service(store.clone(), channel, clock);

    let updated = service.update_policy("operator:sre", QueueKey::Workflow, 0, None).await;
    assert!(updated.is_ok());

    let handle = Arc::new(RecordingHandle::new());
    let mut agent = ScalingAgent::new(
        service,
        QueueKey::Workflow,
        "worker-1".to_owned(),
        handle.clone(),
    );

    let applied = agent.refresh_and_apply().await;
    assert_eq!(applied.ok(), Some(0));
    assert_eq!(handle.applied.load(Ordering::SeqCst), 0);
    assert_eq!(store.acks.lock().await.len(), 1);
}

#[tokio::test]
async fn repeated_refreshes_with_an_unchanged_value_skip_the_apply() {
    let store = Arc::new(FakeScalingStore::default());
    let channel = Arc::new(FakeScalingChannel::default());
    let clock = clock();
    let service = service(store.clone(), channel, clock);
    let handle = Arc::new(RecordingHandle::new());

    let mut agent = ScalingAgent::new(
        service,
        QueueKey::Workflow,
        "worker-1".to_owned(),
        handle.clone(),
    );

    let first = agent.refresh_and_apply().await;
    let second = agent.refresh_and_apply().await;
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(handle.applications.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_applies_record_a_failed_ack() {
    let store = Arc::new(FakeScalingStore::default());
    let channel = Arc::new(FakeScalingChannel::default());
    let clock = clock();
    let service = service(store.clone(), channel, clock);

    let handle = Arc::new(RecordingHandle {
        fail: true,
        ..RecordingHandle::new()
    });
    let mut agent = ScalingAgent::new(
        service,
        QueueKey::Workflow,
        "worker-1".to_owned(),
        handle,
    );

    let refreshed = agent.refresh_and_apply().await;
    assert!(refreshed.is_ok());

    let acks = store.acks.lock().await;
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].status, ScalingAckStatus::Failed);
    assert!(acks[0].error.as_deref().is_some_and(|error| error.contains("resize")));
}
