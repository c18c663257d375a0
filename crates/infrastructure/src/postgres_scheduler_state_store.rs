//! PostgreSQL-backed event scheduler state.
//!
//! Windowed counters (source rate limits, trigger failure and launch
//! windows) follow the upsert compare-and-set pattern: one statement resets
//! an expired window or increments the live one and returns the count, so
//! concurrent writers agree on the decision.

use async_trait::async_trait;
use apphub_application::{
    RateLimitDecision, SchedulerStateStore, SourceMetrics, SourceMetricsUpdate, SourcePauseState,
    SourceRateLimit, TriggerFailureDecision, TriggerMetricKind, TriggerMetrics,
    TriggerPauseState,
};
use apphub_core::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// PostgreSQL implementation of the scheduler state store port.
#[derive(Clone)]
pub struct PostgresSchedulerStateStore {
    pool: PgPool,
}

impl PostgresSchedulerStateStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn bump_window(
        &self,
        table: &str,
        key_column: &str,
        key: &WindowKey<'_>,
        window_ms: i64,
        now: DateTime<Utc>,
    ) -> AppResult<i64> {
        // Table and column names come from a fixed internal set.
        let statement = format!(
            r#"
            INSERT INTO {table} ({key_column}, window_started_at, event_count)
            VALUES ($1, $2, 1)
            ON CONFLICT ({key_column}) DO UPDATE
            SET
                event_count = CASE
                    WHEN {table}.window_started_at + make_interval(secs => $3::float8) < $2
                    THEN 1
                    ELSE {table}.event_count + 1
                END,
                window_started_at = CASE
                    WHEN {table}.window_started_at + make_interval(secs => $3::float8) < $2
                    THEN $2
                    ELSE {table}.window_started_at
                END
            RETURNING event_count
            "#
        );

        let query = sqlx::query_as::<_, CountRow>(statement.as_str());
        let query = match key {
            WindowKey::Text(value) => query.bind(*value),
            WindowKey::Id(value) => query.bind(*value),
        };

        let row = query
            .bind(now)
            .bind(window_ms as f64 / 1_000.0)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to bump {table} window: {error}"))
            })?;

        Ok(row.event_count)
    }
}

enum WindowKey<'a> {
    Text(&'a str),
    Id(Uuid),
}

#[async_trait]
impl SchedulerStateStore for PostgresSchedulerStateStore {
    async fn find_source_pause(
        &self,
        source: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<SourcePauseState>> {
        let row = sqlx::query_as::<_, SourcePauseRow>(
            r#"
            SELECT source, until, reason, manual, details
            FROM event_source_pauses
            WHERE source = $1 AND until > $2
            "#,
        )
        .bind(source)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load pause for source '{source}': {error}"))
        })?;

        Ok(row.map(SourcePauseRow::into_state))
    }

    async fn pause_source(&self, state: SourcePauseState) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO event_source_pauses (source, until, reason, manual, details, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (source) DO UPDATE
            SET
                until = EXCLUDED.until,
                reason = EXCLUDED.reason,
                manual = EXCLUDED.manual,
                details = EXCLUDED.details,
                updated_at = now()
            "#,
        )
        .bind(state.source.as_str())
        .bind(state.until)
        .bind(state.reason.as_str())
        .bind(state.manual)
        .bind(state.details.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to pause source '{}': {error}", state.source))
        })?;

        Ok(())
    }

    async fn resume_source(&self, source: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM event_source_pauses
            WHERE source = $1
            "#,
        )
        .bind(source)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to resume source '{source}': {error}"))
        })?;

        Ok(())
    }

    async fn record_source_event(
        &self,
        limit: &SourceRateLimit,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitDecision> {
        let count = self
            .bump_window(
                "event_source_rate_windows",
                "source",
                &WindowKey::Text(limit.source.as_str()),
                limit.interval_ms,
                now,
            )
            .await?;

        if count <= limit.limit {
            return Ok(RateLimitDecision::Allowed);
        }

        let until = now + Duration::milliseconds(limit.pause_ms);
        let reason = "rate_limit_exceeded".to_owned();
        self.pause_source(SourcePauseState {
            source: limit.source.clone(),
            until,
            reason: reason.clone(),
            manual: false,
            details: None,
        })
        .await?;

        Ok(RateLimitDecision::Paused { until, reason })
    }

    async fn find_trigger_pause(
        &self,
        trigger_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<TriggerPauseState>> {
        let row = sqlx::query_as::<_, TriggerPauseRow>(
            r#"
            SELECT trigger_id, until, reason
            FROM event_trigger_pauses
            WHERE trigger_id = $1 AND until > $2
            "#,
        )
        .bind(trigger_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load pause for trigger '{trigger_id}': {error}"))
        })?;

        Ok(row.map(TriggerPauseRow::into_state))
    }

    async fn record_trigger_failure(
        &self,
        trigger_id: Uuid,
        window_ms: i64,
        threshold: i64,
        pause_ms: i64,
        now: DateTime<Utc>,
    ) -> AppResult<TriggerFailureDecision> {
        let failures = self
            .bump_window(
                "event_trigger_failure_windows",
                "trigger_id",
                &WindowKey::Id(trigger_id),
                window_ms,
                now,
            )
            .await?;

        let paused_until = if failures >= threshold {
            let until = now + Duration::milliseconds(pause_ms);
            sqlx::query(
                r#"
                INSERT INTO event_trigger_pauses (trigger_id, until, reason, updated_at)
                VALUES ($1, $2, 'error_threshold_exceeded', now())
                ON CONFLICT (trigger_id) DO UPDATE
                SET until = EXCLUDED.until, reason = EXCLUDED.reason, updated_at = now()
                "#,
            )
            .bind(trigger_id)
            .bind(until)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to pause trigger '{trigger_id}': {error}"))
            })?;

            Some(until)
        } else {
            None
        };

        Ok(TriggerFailureDecision {
            failures,
            paused_until,
        })
    }

    async fn clear_trigger_failures(&self, trigger_id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM event_trigger_failure_windows
            WHERE trigger_id = $1
            "#,
        )
        .bind(trigger_id)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to clear failure window for trigger '{trigger_id}': {error}"
            ))
        })?;

        Ok(())
    }

    async fn record_trigger_launch(
        &self,
        trigger_id: Uuid,
        window_ms: i64,
        max_count: i64,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let count = self
            .bump_window(
                "event_trigger_launch_windows",
                "trigger_id",
                &WindowKey::Id(trigger_id),
                window_ms,
                now,
            )
            .await?;

        Ok(count <= max_count)
    }

    async fn record_source_metrics(
        &self,
        source: &str,
        update: SourceMetricsUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let lag_ms = update.lag_ms.unwrap_or(0);

        sqlx::query(
            r#"
            INSERT INTO event_scheduler_source_metrics (
                source, total, throttled, dropped, failures,
                total_lag_ms, last_lag_ms, max_lag_ms, last_event_at
            )
            VALUES ($1, 1, $2, $3, $4, $5, $5, $5, $6)
            ON CONFLICT (source) DO UPDATE
            SET
                total = event_scheduler_source_metrics.total + 1,
                throttled = event_scheduler_source_metrics.throttled + $2,
                dropped = event_scheduler_source_metrics.dropped + $3,
                failures = event_scheduler_source_metrics.failures + $4,
                total_lag_ms = event_scheduler_source_metrics.total_lag_ms + $5,
                last_lag_ms = CASE WHEN $7 THEN $5
                              ELSE event_scheduler_source_metrics.last_lag_ms END,
                max_lag_ms = GREATEST(event_scheduler_source_metrics.max_lag_ms, $5),
                last_event_at = $6
            "#,
        )
        .bind(source)
        .bind(i64::from(update.throttled))
        .bind(i64::from(update.dropped))
        .bind(i64::from(update.failure))
        .bind(lag_ms)
        .bind(now)
        .bind(update.lag_ms.is_some())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to record metrics for source '{source}': {error}"))
        })?;

        Ok(())
    }

    async fn source_metrics(&self, source: &str) -> AppResult<Option<SourceMetrics>> {
        let row = sqlx::query_as::<_, SourceMetricsRow>(
            r#"
            SELECT source, total, throttled, dropped, failures,
                   total_lag_ms, last_lag_ms, max_lag_ms, last_event_at
            FROM event_scheduler_source_metrics
            WHERE source = $1
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load metrics for source '{source}': {error}"))
        })?;

        Ok(row.map(SourceMetricsRow::into_metrics))
    }

    async fn record_trigger_metric(
        &self,
        trigger_id: Uuid,
        kind: TriggerMetricKind,
        error: Option<&str>,
    ) -> AppResult<()> {
        // The counter column is selected from a fixed internal set.
        let column = kind.as_str();
        let statement = format!(
            r#"
            INSERT INTO event_scheduler_trigger_metrics (trigger_id, {column}, last_status, last_error)
            VALUES ($1, 1, $2, $3)
            ON CONFLICT (trigger_id) DO UPDATE
            SET
                {column} = event_scheduler_trigger_metrics.{column} + 1,
                last_status = $2,
                last_error = $3
            "#
        );

        sqlx::query(statement.as_str())
            .bind(trigger_id)
            .bind(kind.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to record metric for trigger '{trigger_id}': {error}"
                ))
            })?;

        Ok(())
    }

    async fn trigger_metrics(&self, trigger_id: Uuid) -> AppResult<Option<TriggerMetrics>> {
        let row = sqlx::query_as::<_, TriggerMetricsRow>(
            r#"
            SELECT filtered, matched, launched, throttled, skipped, failed, paused,
                   last_status, last_error
            FROM event_scheduler_trigger_metrics
            WHERE trigger_id = $1
            "#,
        )
        .bind(trigger_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load metrics for trigger '{trigger_id}': {error}"
            ))
        })?;

        Ok(row.map(TriggerMetricsRow::into_metrics))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CountRow {
    event_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SourcePauseRow {
    source: String,
    until: DateTime<Utc>,
    reason: String,
    manual: bool,
    details: Option<Value>,
}

impl SourcePauseRow {
    fn into_state(self) -> SourcePauseState {
        SourcePauseState {
            source: self.source,
            until: self.until,
            reason: self.reason,
            manual: self.manual,
            details: self.details,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TriggerPauseRow {
    trigger_id: Uuid,
    until: DateTime<Utc>,
    reason: String,
}

impl TriggerPauseRow {
    fn into_state(self) -> TriggerPauseState {
        TriggerPauseState {
            trigger_id: self.trigger_id,
            until: self.until,
            reason: self.reason,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SourceMetricsRow {
    source: String,
    total: i64,
    throttled: i64,
    dropped: i64,
    failures: i64,
    total_lag_ms: i64,
    last_lag_ms: i64,
    max_lag_ms: i64,
    last_event_at: Option<DateTime<Utc>>,
}

impl SourceMetricsRow {
    fn into_metrics(self) -> SourceMetrics {
        SourceMetrics {
            source: self.source,
            total: self.total,
            throttled: self.throttled,
            dropped: self.dropped,
            failures: self.failures,
            total_lag_ms: self.total_lag_ms,
            last_lag_ms: self.last_lag_ms,
            max_lag_ms: self.max_lag_ms,
            last_event_at: self.last_event_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TriggerMetricsRow {
    filtered: i64,
    matched: i64,
    launched: i64,
    throttled: i64,
    skipped: i64,
    failed: i64,
    paused: i64,
    last_status: Option<String>,
    last_error: Option<String>,
}

impl TriggerMetricsRow {
    fn into_metrics(self) -> TriggerMetrics {
        TriggerMetrics {
            filtered: self.filtered,
            matched: self.matched,
            launched: self.launched,
            throttled: self.throttled,
            skipped: self.skipped,
            failed: self.failed,
            paused: self.paused,
            last_status: self.last_status,
            last_error: self.last_error,
        }
    }
}
