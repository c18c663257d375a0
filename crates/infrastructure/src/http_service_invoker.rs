//! HTTP client adapter for service steps.

use std::time::Duration;

use apphub_application::{RegisteredService, ServiceInvocation, ServiceInvoker, ServiceResponse};
use apphub_core::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::Value;

/// reqwest-based implementation of the service invoker port.
#[derive(Clone)]
pub struct HttpServiceInvoker {
    http_client: reqwest::Client,
}

impl HttpServiceInvoker {
    /// Creates an invoker over a shared HTTP client.
    #[must_use]
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl ServiceInvoker for HttpServiceInvoker {
    async fn invoke(
        &self,
        service: &RegisteredService,
        invocation: ServiceInvocation,
    ) -> AppResult<ServiceResponse> {
        let method =
            reqwest::Method::from_bytes(invocation.method.as_bytes()).map_err(|error| {
                AppError::Validation(format!(
                    "invalid HTTP method '{}': {error}",
                    invocation.method
                ))
            })?;

        let url = format!(
            "{}/{}",
            service.base_url.trim_end_matches('/'),
            invocation.path.trim_start_matches('/')
        );

        let mut builder = self.http_client.request(method, url.as_str());

        for (name, value) in &invocation.headers {
            builder = builder.header(name, value);
        }

        if !invocation.query.is_empty() {
            builder = builder.query(&invocation.query);
        }

        if let Some(body) = &invocation.body {
            builder = builder.json(body);
        }

        if let Some(timeout_ms) = invocation.timeout_ms {
            builder = builder.timeout(Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0)));
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                AppError::Timeout(format!(
                    "service '{}' did not respond in time: {error}",
                    service.slug
                ))
            } else {
                AppError::RetryableExternal(format!(
                    "request to service '{}' failed: {error}",
                    service.slug
                ))
            }
        })?;

        let status = response.status().as_u16();
        let raw = response.text().await.map_err(|error| {
            AppError::RetryableExternal(format!(
                "failed to read response from service '{}': {error}",
                service.slug
            ))
        })?;

        let body = if raw.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(raw.as_str()).unwrap_or(Value::String(raw))
        };

        Ok(ServiceResponse { status, body })
    }
}
