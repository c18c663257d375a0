use async_trait::async_trait;
use apphub_core::{AppResult, RunId};
use serde_json::Value;

/// Result status reported by the job runtime collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRunStatus {
    /// The job handler finished successfully.
    Succeeded,
    /// The job handler reported a failure.
    Failed,
}

/// Dispatch payload for one job step attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunRequest {
    /// Registered job bundle slug.
    pub job_slug: String,
    /// Owning workflow run.
    pub run_id: RunId,
    /// Dispatching step identifier.
    pub step_id: String,
    /// Resolved step parameters.
    pub parameters: Value,
    /// Optional per-attempt deadline.
    pub timeout_ms: Option<i64>,
}

/// Outcome of one job step attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunOutcome {
    /// Handler result status.
    pub status: JobRunStatus,
    /// Identifier assigned by the job runtime, when available.
    pub job_run_id: Option<String>,
    /// Handler result value; may carry produced-asset records.
    pub result: Value,
    /// Failure detail for failed runs.
    pub error_message: Option<String>,
}

/// Port for the external job runtime collaborator.
///
/// A job bundle is an opaque, versioned, checksum-addressed artifact; the
/// core only sees this handler contract.
#[async_trait]
pub trait JobRuntime: Send + Sync {
    /// Runs one job attempt to completion.
    async fn run_job(&self, request: JobRunRequest) -> AppResult<JobRunOutcome>;
}
