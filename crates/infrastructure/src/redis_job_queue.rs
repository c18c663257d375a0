//! Redis-backed distributed job queue.
//!
//! Per queue: a hash of job payloads keyed by job id, a ready list, and a
//! delayed sorted set scored by run-at time. Duplicate job ids are detected
//! with `HSETNX`, making re-enqueues a no-op.

use apphub_application::{EnqueueDisposition, JobQueue, QueueCounts, QueueJob, QueueKey};
use apphub_core::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct StoredJob {
    name: String,
    payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_at_ms: Option<i64>,
}

/// Redis implementation of the job queue port.
#[derive(Clone)]
pub struct RedisJobQueue {
    client: redis::Client,
    key_prefix: String,
}

impl RedisJobQueue {
    /// Creates a queue adapter with a configured Redis client and key prefix.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn jobs_key(&self, key: QueueKey) -> String {
        format!("{}:{}:jobs", self.key_prefix, key.as_str())
    }

    fn ready_key(&self, key: QueueKey) -> String {
        format!("{}:{}:ready", self.key_prefix, key.as_str())
    }

    fn delayed_key(&self, key: QueueKey) -> String {
        format!("{}:{}:delayed", self.key_prefix, key.as_str())
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to connect to redis: {error}"))
            })
    }

    /// Moves due delayed jobs onto the ready list.
    pub async fn promote_due_jobs(&self, key: QueueKey, now: DateTime<Utc>) -> AppResult<u64> {
        let mut connection = self.connection().await?;
        let delayed_key = self.delayed_key(key);
        let ready_key = self.ready_key(key);

        let due: Vec<String> = connection
            .zrangebyscore(delayed_key.as_str(), "-inf", now.timestamp_millis() as f64)
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to read delayed jobs: {error}"))
            })?;

        let mut promoted = 0_u64;
        for job_id in due {
            let removed: i64 = connection
                .zrem(delayed_key.as_str(), job_id.as_str())
                .await
                .map_err(|error| {
                    AppError::RetryableExternal(format!("failed to promote delayed job: {error}"))
                })?;

            // Another worker may have promoted it first.
            if removed > 0 {
                connection
                    .lpush::<_, _, ()>(ready_key.as_str(), job_id.as_str())
                    .await
                    .map_err(|error| {
                        AppError::RetryableExternal(format!(
                            "failed to push promoted job: {error}"
                        ))
                    })?;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Pops one ready job, blocking up to `timeout_seconds`.
    pub async fn pop(
        &self,
        key: QueueKey,
        timeout_seconds: f64,
    ) -> AppResult<Option<QueueJob>> {
        self.promote_due_jobs(key, Utc::now()).await?;

        let mut connection = self.connection().await?;
        let popped: Option<(String, String)> = connection
            .brpop(self.ready_key(key), timeout_seconds)
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to pop queue job: {error}"))
            })?;

        let Some((_, job_id)) = popped else {
            return Ok(None);
        };

        let encoded: Option<String> = connection
            .hget(self.jobs_key(key), job_id.as_str())
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to read queue job body: {error}"))
            })?;

        connection
            .hdel::<_, _, ()>(self.jobs_key(key), job_id.as_str())
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to delete queue job body: {error}"))
            })?;

        let Some(encoded) = encoded else {
            // Removed between pop and read; treat as consumed elsewhere.
            return Ok(None);
        };

        let stored: StoredJob = serde_json::from_str(encoded.as_str()).map_err(|error| {
            AppError::Internal(format!("failed to decode queue job '{job_id}': {error}"))
        })?;

        Ok(Some(QueueJob {
            name: stored.name,
            job_id: Some(job_id),
            payload: stored.payload,
            run_at: stored
                .run_at_ms
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        }))
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, key: QueueKey, job: QueueJob) -> AppResult<EnqueueDisposition> {
        let job_id = job.job_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let explicit_id = job.job_id.is_some();

        let stored = StoredJob {
            name: job.name,
            payload: job.payload,
            run_at_ms: job.run_at.map(|run_at| run_at.timestamp_millis()),
        };
        let encoded = serde_json::to_string(&stored).map_err(|error| {
            AppError::Internal(format!("failed to encode queue job '{job_id}': {error}"))
        })?;

        let mut connection = self.connection().await?;

        let stored_new: bool = connection
            .hset_nx(self.jobs_key(key), job_id.as_str(), encoded.as_str())
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to store queue job: {error}"))
            })?;

        if !stored_new && explicit_id {
            return Ok(EnqueueDisposition::Duplicate);
        }

        match job.run_at {
            Some(run_at) => {
                connection
                    .zadd::<_, _, _, ()>(
                        self.delayed_key(key),
                        job_id.as_str(),
                        run_at.timestamp_millis() as f64,
                    )
                    .await
                    .map_err(|error| {
                        AppError::RetryableExternal(format!(
                            "failed to schedule delayed job: {error}"
                        ))
                    })?;
            }
            None => {
                connection
                    .lpush::<_, _, ()>(self.ready_key(key), job_id.as_str())
                    .await
                    .map_err(|error| {
                        AppError::RetryableExternal(format!("failed to push queue job: {error}"))
                    })?;
            }
        }

        Ok(EnqueueDisposition::Enqueued)
    }

    async fn remove_job(&self, key: QueueKey, job_id: &str) -> AppResult<bool> {
        let mut connection = self.connection().await?;

        let removed: i64 = connection
            .hdel(self.jobs_key(key), job_id)
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to remove queue job: {error}"))
            })?;

        if removed == 0 {
            return Ok(false);
        }

        connection
            .lrem::<_, _, ()>(self.ready_key(key), 0, job_id)
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to remove ready entry: {error}"))
            })?;
        connection
            .zrem::<_, _, ()>(self.delayed_key(key), job_id)
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to remove delayed entry: {error}"))
            })?;

        Ok(true)
    }

    async fn counts(&self, key: QueueKey) -> AppResult<QueueCounts> {
        let mut connection = self.connection().await?;

        let waiting: i64 = connection.llen(self.ready_key(key)).await.map_err(|error| {
            AppError::RetryableExternal(format!("failed to count ready jobs: {error}"))
        })?;
        let delayed: i64 = connection.zcard(self.delayed_key(key)).await.map_err(|error| {
            AppError::RetryableExternal(format!("failed to count delayed jobs: {error}"))
        })?;

        // Completed and failed jobs are removed on settlement, mirroring
        // removeOnComplete / removeOnFail queue options.
        Ok(QueueCounts {
            waiting,
            delayed,
            ..QueueCounts::default()
        })
    }
}
