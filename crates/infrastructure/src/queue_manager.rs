//! Queue facade recomputing inline-vs-distributed mode per call.

use std::env;
use std::sync::Arc;

use apphub_application::{EnqueueDisposition, JobQueue, QueueCounts, QueueJob, QueueKey};
use apphub_core::{AppError, AppResult};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::inline_job_queue::InlineJobQueue;
use crate::redis_job_queue::RedisJobQueue;

const REDIS_URL_ENV: &str = "REDIS_URL";
const EVENTS_MODE_ENV: &str = "APPHUB_EVENTS_MODE";
const QUEUE_KEY_PREFIX: &str = "apphub:queue";

/// Queue operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Producer executes the job body synchronously in-process.
    Inline,
    /// Jobs are serialized onto the Redis broker.
    Distributed,
}

/// Facade dispatching to the inline or Redis queue.
///
/// Mode is recomputed from the environment on every public call; a mode
/// transition disposes the open Redis queue.
#[derive(Clone)]
pub struct QueueManager {
    inline: InlineJobQueue,
    redis: Arc<Mutex<Option<RedisJobQueue>>>,
}

impl QueueManager {
    /// Creates a manager wrapping one inline queue.
    #[must_use]
    pub fn new(inline: InlineJobQueue) -> Self {
        Self {
            inline,
            redis: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the inline queue for handler registration.
    #[must_use]
    pub fn inline(&self) -> &InlineJobQueue {
        &self.inline
    }

    /// Computes the current mode from the environment.
    #[must_use]
    pub fn mode() -> QueueMode {
        Self::mode_from(
            env::var(REDIS_URL_ENV).ok().as_deref(),
            env::var(EVENTS_MODE_ENV).ok().as_deref(),
        )
    }

    /// Computes the mode from explicit configuration values.
    ///
    /// `REDIS_URL=inline` or `APPHUB_EVENTS_MODE=inline` selects inline mode,
    /// as does a missing broker URL; any other value selects distributed.
    #[must_use]
    pub fn mode_from(redis_url: Option<&str>, events_mode: Option<&str>) -> QueueMode {
        let redis_url = redis_url.unwrap_or_default().trim();
        let events_mode = events_mode.unwrap_or_default().trim();

        if redis_url.eq_ignore_ascii_case("inline")
            || events_mode.eq_ignore_ascii_case("inline")
            || redis_url.is_empty()
        {
            QueueMode::Inline
        } else {
            QueueMode::Distributed
        }
    }

    /// Returns the distributed queue, or `None` in inline mode.
    pub async fn try_get_distributed(&self) -> AppResult<Option<RedisJobQueue>> {
        let mut redis = self.redis.lock().await;

        if Self::mode() == QueueMode::Inline {
            if redis.take().is_some() {
                info!("queue mode changed to inline; disposing redis queue");
            }
            return Ok(None);
        }

        if redis.is_none() {
            let url = env::var(REDIS_URL_ENV).map_err(|_| {
                AppError::Validation(format!(
                    "{REDIS_URL_ENV} is required for distributed queue mode"
                ))
            })?;
            let client = redis::Client::open(url.as_str()).map_err(|error| {
                AppError::Validation(format!("invalid {REDIS_URL_ENV}: {error}"))
            })?;

            info!("queue mode is distributed; opening redis queue");
            *redis = Some(RedisJobQueue::new(client, QUEUE_KEY_PREFIX));
        }

        Ok(redis.clone())
    }
}

#[async_trait]
impl JobQueue for QueueManager {
    async fn enqueue(&self, key: QueueKey, job: QueueJob) -> AppResult<EnqueueDisposition> {
        match self.try_get_distributed().await? {
            Some(queue) => queue.enqueue(key, job).await,
            None => self.inline.enqueue(key, job).await,
        }
    }

    async fn remove_job(&self, key: QueueKey, job_id: &str) -> AppResult<bool> {
        match self.try_get_distributed().await? {
            Some(queue) => queue.remove_job(key, job_id).await,
            None => self.inline.remove_job(key, job_id).await,
        }
    }

    async fn counts(&self, key: QueueKey) -> AppResult<QueueCounts> {
        match self.try_get_distributed().await? {
            Some(queue) => queue.counts(key).await,
            None => self.inline.counts(key).await,
        }
    }
}
