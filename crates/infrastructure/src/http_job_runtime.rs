//! HTTP adapter for the external job runtime collaborator.

use apphub_application::{JobRunOutcome, JobRunRequest, JobRunStatus, JobRuntime};
use apphub_core::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP-based implementation of the job runtime port.
///
/// Dispatches a bundle invocation to the job runner service and waits for
/// the handler result.
#[derive(Clone)]
pub struct HttpJobRuntime {
    http_client: reqwest::Client,
    base_url: String,
    shared_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobRunRequestBody<'a> {
    #[serde(rename = "jobSlug")]
    job_slug: &'a str,
    #[serde(rename = "runId")]
    run_id: String,
    #[serde(rename = "stepId")]
    step_id: &'a str,
    parameters: &'a Value,
    #[serde(rename = "timeoutMs", skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JobRunResponseBody {
    status: String,
    #[serde(rename = "jobRunId", default)]
    job_run_id: Option<String>,
    #[serde(default)]
    result: Value,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

impl HttpJobRuntime {
    /// Creates a runtime adapter.
    #[must_use]
    pub fn new(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        shared_secret: Option<String>,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            shared_secret,
        }
    }
}

#[async_trait]
impl JobRuntime for HttpJobRuntime {
    async fn run_job(&self, request: JobRunRequest) -> AppResult<JobRunOutcome> {
        let endpoint = format!("{}/api/internal/job-runs", self.base_url);
        let body = JobRunRequestBody {
            job_slug: request.job_slug.as_str(),
            run_id: request.run_id.to_string(),
            step_id: request.step_id.as_str(),
            parameters: &request.parameters,
            timeout_ms: request.timeout_ms,
        };

        let mut builder = self.http_client.post(endpoint.as_str()).json(&body);
        if let Some(secret) = &self.shared_secret {
            builder = builder.bearer_auth(secret);
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                AppError::Timeout(format!(
                    "job runtime did not respond for '{}': {error}",
                    request.job_slug
                ))
            } else {
                AppError::RetryableExternal(format!(
                    "failed to call job runtime for '{}': {error}",
                    request.job_slug
                ))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_owned());
            return Err(AppError::RetryableExternal(format!(
                "job runtime returned status {} for '{}': {detail}",
                status.as_u16(),
                request.job_slug
            )));
        }

        let parsed = response.json::<JobRunResponseBody>().await.map_err(|error| {
            AppError::RetryableExternal(format!(
                "failed to parse job runtime response for '{}': {error}",
                request.job_slug
            ))
        })?;

        let status = match parsed.status.as_str() {
            "succeeded" => JobRunStatus::Succeeded,
            _ => JobRunStatus::Failed,
        };

        Ok(JobRunOutcome {
            status,
            job_run_id: parsed.job_run_id,
            result: parsed.result,
            error_message: parsed.error_message,
        })
    }
}
