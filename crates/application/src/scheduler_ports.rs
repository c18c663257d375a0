//! Ports and record types for event scheduler state and ingress metrics.

use async_trait::async_trait;
use apphub_core::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-source rate limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRateLimit {
    /// Limited source identifier.
    pub source: String,
    /// Maximum envelopes inside the rolling window.
    pub limit: i64,
    /// Rolling window length.
    pub interval_ms: i64,
    /// Pause applied when the limit is exceeded.
    pub pause_ms: i64,
}

/// Active pause state for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePauseState {
    /// Paused source identifier.
    pub source: String,
    /// Pause end.
    pub until: DateTime<Utc>,
    /// Why the source was paused.
    pub reason: String,
    /// Manual pauses are only lifted by operators.
    pub manual: bool,
    /// Optional structured detail.
    pub details: Option<Value>,
}

/// Outcome of counting one envelope against a source rate limit.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    /// The envelope is within limits.
    Allowed,
    /// The limit was exceeded; the source is now paused.
    Paused {
        /// Pause end.
        until: DateTime<Utc>,
        /// Pause reason recorded with the state.
        reason: String,
    },
}

/// Active pause state for one trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPauseState {
    /// Paused trigger.
    pub trigger_id: Uuid,
    /// Pause end.
    pub until: DateTime<Utc>,
    /// Why the trigger was paused.
    pub reason: String,
}

/// Outcome of recording one trigger failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerFailureDecision {
    /// Failures inside the current window, this one included.
    pub failures: i64,
    /// Pause end when the threshold was crossed.
    pub paused_until: Option<DateTime<Utc>>,
}

/// Metric deltas recorded per processed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceMetricsUpdate {
    /// Envelope was throttled into a scheduled retry.
    pub throttled: bool,
    /// Envelope was intentionally dropped.
    pub dropped: bool,
    /// Processing failed transiently.
    pub failure: bool,
    /// Ingress lag between occurrence and processing.
    pub lag_ms: Option<i64>,
}

/// Aggregate per-source ingress counters.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMetrics {
    /// Source identifier.
    pub source: String,
    /// Total envelopes observed.
    pub total: i64,
    /// Envelopes throttled into retries.
    pub throttled: i64,
    /// Envelopes intentionally dropped.
    pub dropped: i64,
    /// Transient processing failures.
    pub failures: i64,
    /// Sum of observed lag.
    pub total_lag_ms: i64,
    /// Most recent observed lag.
    pub last_lag_ms: i64,
    /// Maximum observed lag.
    pub max_lag_ms: i64,
    /// Last envelope timestamp.
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Per-trigger delivery counter categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMetricKind {
    /// Filter predicate rejected the envelope.
    Filtered,
    /// Predicate matched.
    Matched,
    /// A run was launched.
    Launched,
    /// Throttle rejected the launch.
    Throttled,
    /// Trigger disabled or otherwise skipped.
    Skipped,
    /// Evaluation raised an error.
    Failed,
    /// Trigger was paused at evaluation time.
    Paused,
}

impl TriggerMetricKind {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filtered => "filtered",
            Self::Matched => "matched",
            Self::Launched => "launched",
            Self::Throttled => "throttled",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

/// Aggregate per-trigger delivery counters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriggerMetrics {
    /// Envelopes rejected by the filter.
    pub filtered: i64,
    /// Envelopes matching the filter.
    pub matched: i64,
    /// Runs launched.
    pub launched: i64,
    /// Launches rejected by throttle.
    pub throttled: i64,
    /// Evaluations skipped.
    pub skipped: i64,
    /// Evaluations that raised errors.
    pub failed: i64,
    /// Evaluations skipped by a pause.
    pub paused: i64,
    /// Most recent recorded status.
    pub last_status: Option<String>,
    /// Most recent recorded error.
    pub last_error: Option<String>,
}

/// Store port for source pauses, rate limits, trigger failure windows, and
/// ingress metrics.
///
/// Counter evaluations are atomic at the store layer (compare-and-set on the
/// counter row); metric writes are idempotent upserts.
#[async_trait]
pub trait SchedulerStateStore: Send + Sync {
    /// Returns the active pause for one source, if any.
    async fn find_source_pause(
        &self,
        source: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<SourcePauseState>>;

    /// Inserts or replaces a pause for one source.
    async fn pause_source(&self, state: SourcePauseState) -> AppResult<()>;

    /// Lifts any pause on one source.
    async fn resume_source(&self, source: &str) -> AppResult<()>;

    /// Counts one envelope against the source rate limit; pauses the source
    /// when the window limit is exceeded.
    async fn record_source_event(
        &self,
        limit: &SourceRateLimit,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitDecision>;

    /// Returns the active pause for one trigger, if any.
    async fn find_trigger_pause(
        &self,
        trigger_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<TriggerPauseState>>;

    /// Records one trigger failure inside the rolling error window and pauses
    /// the trigger when the threshold is crossed.
    async fn record_trigger_failure(
        &self,
        trigger_id: Uuid,
        window_ms: i64,
        threshold: i64,
        pause_ms: i64,
        now: DateTime<Utc>,
    ) -> AppResult<TriggerFailureDecision>;

    /// Clears the failure window after a successful evaluation.
    async fn clear_trigger_failures(&self, trigger_id: Uuid) -> AppResult<()>;

    /// Counts one launch against the trigger throttle window; returns false
    /// when the launch must be rejected.
    async fn record_trigger_launch(
        &self,
        trigger_id: Uuid,
        window_ms: i64,
        max_count: i64,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Applies metric deltas for one source.
    async fn record_source_metrics(
        &self,
        source: &str,
        update: SourceMetricsUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Returns aggregate counters for one source.
    async fn source_metrics(&self, source: &str) -> AppResult<Option<SourceMetrics>>;

    /// Increments one trigger delivery counter.
    async fn record_trigger_metric(
        &self,
        trigger_id: Uuid,
        kind: TriggerMetricKind,
        error: Option<&str>,
    ) -> AppResult<()>;

    /// Returns aggregate counters for one trigger.
    async fn trigger_metrics(&self, trigger_id: Uuid) -> AppResult<Option<TriggerMetrics>>;
}
