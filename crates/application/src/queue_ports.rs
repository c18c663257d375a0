use async_trait::async_trait;
use apphub_core::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Queue job name for ingesting one submitted envelope.
pub const JOB_EVENT_INGEST: &str = "event-ingest";
/// Queue job name for scheduled event ingress retries.
pub const JOB_EVENT_INGRESS_RETRY: &str = "event-ingress-retry";
/// Queue job name for trigger evaluation of one envelope.
pub const JOB_TRIGGER_EVALUATE: &str = "event-trigger-evaluate";
/// Queue job name for retrying one failed trigger evaluation.
pub const JOB_TRIGGER_RETRY: &str = "event-trigger-retry";
/// Queue job name for executing one workflow run.
pub const JOB_WORKFLOW_RUN: &str = "workflow-run";
/// Queue job name for resuming one workflow run after a step retry delay.
pub const JOB_WORKFLOW_RETRY: &str = "workflow-retry";

/// Stable keys identifying the configured queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKey {
    /// Repository ingestion jobs.
    Ingest,
    /// Container image build jobs.
    Build,
    /// Container launch jobs.
    Launch,
    /// Workflow run execution jobs.
    Workflow,
    /// Event ingress jobs and scheduled ingress retries.
    Event,
    /// Trigger evaluation jobs and trigger retries.
    EventTrigger,
}

impl QueueKey {
    /// Returns stable configuration value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Build => "build",
            Self::Launch => "launch",
            Self::Workflow => "workflow",
            Self::Event => "event",
            Self::EventTrigger => "event_trigger",
        }
    }

    /// Parses a stable configuration value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "ingest" => Ok(Self::Ingest),
            "build" => Ok(Self::Build),
            "launch" => Ok(Self::Launch),
            "workflow" => Ok(Self::Workflow),
            "event" => Ok(Self::Event),
            "event_trigger" => Ok(Self::EventTrigger),
            _ => Err(AppError::Validation(format!("unknown queue key '{value}'"))),
        }
    }

    /// Returns every configured queue key.
    #[must_use]
    pub fn all() -> [Self; 6] {
        [
            Self::Ingest,
            Self::Build,
            Self::Launch,
            Self::Workflow,
            Self::Event,
            Self::EventTrigger,
        ]
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One job submitted to a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueJob {
    /// Job name selecting the handler.
    pub name: String,
    /// Optional stable identifier; duplicate identifiers are suppressed.
    pub job_id: Option<String>,
    /// Handler payload.
    pub payload: Value,
    /// Optional absolute time before which the job must not run.
    pub run_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// Creates an immediate job.
    #[must_use]
    pub fn immediate(name: &str, job_id: Option<String>, payload: Value) -> Self {
        Self {
            name: name.to_owned(),
            job_id,
            payload,
            run_at: None,
        }
    }

    /// Creates a delayed job scheduled at an absolute run-at time.
    #[must_use]
    pub fn delayed(
        name: &str,
        job_id: Option<String>,
        payload: Value,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            job_id,
            payload,
            run_at: Some(run_at),
        }
    }
}

/// How an enqueue request was honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDisposition {
    /// Serialized onto the broker.
    Enqueued,
    /// A job with the same identifier already exists; nothing was added.
    Duplicate,
    /// Inline mode executed the job body synchronously in the caller.
    RanInline,
}

/// Aggregate counters for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    /// Jobs waiting to run.
    pub waiting: i64,
    /// Jobs currently executing.
    pub active: i64,
    /// Jobs completed successfully.
    pub completed: i64,
    /// Jobs that exhausted their attempts.
    pub failed: i64,
    /// Jobs scheduled for a future run-at time.
    pub delayed: i64,
    /// Jobs held while the queue is paused.
    pub paused: i64,
}

/// Queue abstraction shared by inline and distributed modes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submits one job; duplicate job identifiers are a non-error no-op.
    async fn enqueue(&self, key: QueueKey, job: QueueJob) -> AppResult<EnqueueDisposition>;

    /// Removes one pending job by identifier; returns whether it existed.
    async fn remove_job(&self, key: QueueKey, job_id: &str) -> AppResult<bool>;

    /// Returns aggregate counters for one queue.
    async fn counts(&self, key: QueueKey) -> AppResult<QueueCounts>;
}

#[cfg(test)]
mod tests {
    use super::QueueKey;

    #[test]
    fn queue_keys_round_trip_through_strings() {
        for key in QueueKey::all() {
            assert_eq!(QueueKey::parse(key.as_str()).ok(), Some(key));
        }
    }
}
