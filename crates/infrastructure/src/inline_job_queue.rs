//! Inline queue mode: the producer executes the job body synchronously.

use std::collections::HashMap;
use std::sync::Arc;

use apphub_application::{EnqueueDisposition, JobQueue, QueueCounts, QueueJob, QueueKey};
use apphub_core::{AppError, AppResult};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

/// Handler executing jobs for one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Processes one job to completion.
    async fn handle(&self, job: QueueJob) -> AppResult<()>;
}

/// Inline implementation of the job queue port.
///
/// Enqueues run the registered handler in the caller's context. Delayed jobs
/// are not supported inline; they fall back to immediate execution with a
/// warning.
#[derive(Clone, Default)]
pub struct InlineJobQueue {
    handlers: Arc<RwLock<HashMap<QueueKey, Arc<dyn JobHandler>>>>,
}

impl InlineJobQueue {
    /// Creates an inline queue with no handlers registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the worker body for one queue. Last registration wins.
    pub async fn register_handler(&self, key: QueueKey, handler: Arc<dyn JobHandler>) {
        self.handlers.write().await.insert(key, handler);
    }
}

#[async_trait]
impl JobQueue for InlineJobQueue {
    async fn enqueue(&self, key: QueueKey, job: QueueJob) -> AppResult<EnqueueDisposition> {
        if job.run_at.is_some() {
            warn!(
                queue = %key,
                job = %job.name,
                "inline queue mode cannot delay jobs; executing immediately"
            );
        }

        let handler = self.handlers.read().await.get(&key).cloned();
        let Some(handler) = handler else {
            return Err(AppError::Internal(format!(
                "no inline handler registered for queue '{key}'"
            )));
        };

        handler.handle(job).await?;
        Ok(EnqueueDisposition::RanInline)
    }

    async fn remove_job(&self, _key: QueueKey, _job_id: &str) -> AppResult<bool> {
        // Inline jobs are gone the moment enqueue returns.
        Ok(false)
    }

    async fn counts(&self, _key: QueueKey) -> AppResult<QueueCounts> {
        Ok(QueueCounts::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use apphub_application::{EnqueueDisposition, JobQueue, QueueJob, QueueKey};
    use apphub_core::AppResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use super::{InlineJobQueue, JobHandler};

    #[derive(Default)]
    struct CountingHandler {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: QueueJob) -> AppResult<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_runs_the_handler_synchronously() {
        let queue = InlineJobQueue::new();
        let handler = Arc::new(CountingHandler::default());
        queue.register_handler(QueueKey::Event, handler.clone()).await;

        let disposition = queue
            .enqueue(
                QueueKey::Event,
                QueueJob::immediate("event-trigger-evaluate", None, json!({"eventId": "e1"})),
            )
            .await;

        assert_eq!(disposition.ok(), Some(EnqueueDisposition::RanInline));
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delayed_jobs_fall_back_to_immediate_execution() {
        let queue = InlineJobQueue::new();
        let handler = Arc::new(CountingHandler::default());
        queue.register_handler(QueueKey::Event, handler.clone()).await;

        let disposition = queue
            .enqueue(
                QueueKey::Event,
                QueueJob::delayed(
                    "event-ingress-retry",
                    Some("event-ingress-retry--e1".to_owned()),
                    json!({"eventId": "e1"}),
                    Utc::now() + chrono::Duration::minutes(1),
                ),
            )
            .await;

        assert_eq!(disposition.ok(), Some(EnqueueDisposition::RanInline));
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_handlers_are_an_error() {
        let queue = InlineJobQueue::new();
        let result = queue
            .enqueue(
                QueueKey::Workflow,
                QueueJob::immediate("workflow-run", None, json!({})),
            )
            .await;

        assert!(result.is_err());
    }
}
