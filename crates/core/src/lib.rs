//! Shared primitives for all Rust crates in AppHub.

#![forbid(unsafe_code)]

/// Canonical JSON serialization and payload hashing.
pub mod canonical;
/// Wall-clock abstraction used by services.
pub mod clock;
/// Run-key normalization and deterministic job identifiers.
pub mod run_key;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use clock::{Clock, ManualClock, SystemClock};

/// Result type used across AppHub crates.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

/// Stable identifier for one persisted workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Creates a random workflow identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a workflow identifier from an existing UUID value.
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for WorkflowId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Stable identifier for one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Creates a random run identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a run identifier from an existing UUID value.
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// Parses a run identifier from its string form.
    pub fn parse(value: &str) -> AppResult<Self> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|error| AppError::Validation(format!("invalid run id '{value}': {error}")))
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Common application error categories.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Event schema version or hash disagreement.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Write operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller exceeded a rate limit and should retry later.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Human-readable limit description.
        message: String,
        /// Milliseconds until the next attempt may succeed.
        retry_after_ms: Option<u64>,
    },

    /// Target source or trigger is paused.
    #[error("paused: {0}")]
    Paused(String),

    /// Step or service call deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Service step target is not healthy enough to call.
    #[error("service unhealthy: {0}")]
    ServiceUnhealthy(String),

    /// Partitioned asset was produced without a partition key.
    #[error("partition key required: {0}")]
    PartitionKeyRequired(String),

    /// Transient broker, store, or HTTP failure worth retrying.
    #[error("retryable external error: {0}")]
    RetryableExternal(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the stable error kind value persisted with failed steps.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Paused(_) => "paused",
            Self::Timeout(_) => "timeout",
            Self::ServiceUnhealthy(_) => "service_unhealthy",
            Self::PartitionKeyRequired(_) => "partition_key_required",
            Self::RetryableExternal(_) => "retryable_external",
            Self::Internal(_) => "fatal_internal",
        }
    }

    /// Returns true when retry policy applies to this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RetryableExternal(_))
    }
}

/// Truncates an error message to the persisted limit of 500 characters.
#[must_use]
pub fn truncate_error_message(message: &str) -> String {
    message.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::{AppError, NonEmptyString, RunId, truncate_error_message};

    #[test]
    fn non_empty_string_rejects_whitespace() {
        let result = NonEmptyString::new("   ");
        assert!(result.is_err());
    }

    #[test]
    fn run_id_round_trips_through_string_form() {
        let run_id = RunId::new();
        let parsed = RunId::parse(run_id.to_string().as_str());
        assert_eq!(parsed.ok(), Some(run_id));
    }

    #[test]
    fn error_kind_matches_taxonomy() {
        assert_eq!(AppError::Validation(String::new()).kind(), "validation");
        assert_eq!(AppError::Timeout(String::new()).kind(), "timeout");
        assert_eq!(AppError::Internal(String::new()).kind(), "fatal_internal");
        assert!(AppError::RetryableExternal(String::new()).is_retryable());
        assert!(!AppError::Conflict(String::new()).is_retryable());
    }

    #[test]
    fn long_error_messages_are_truncated() {
        let message = "x".repeat(800);
        assert_eq!(truncate_error_message(message.as_str()).len(), 500);
    }
}
