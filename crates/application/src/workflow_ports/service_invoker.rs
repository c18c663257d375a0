use async_trait::async_trait;
use apphub_core::{AppError, AppResult};
use serde_json::Value;

/// Reported health of one registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    /// Fully healthy.
    Healthy,
    /// Reachable but degraded.
    Degraded,
    /// Not reachable or failing health checks.
    Unreachable,
}

impl ServiceHealth {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unreachable" => Ok(Self::Unreachable),
            _ => Err(AppError::Validation(format!(
                "unknown service health '{value}'"
            ))),
        }
    }
}

/// One runtime service known to the registry collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    /// Stable service slug.
    pub slug: String,
    /// Base URL service-step paths are appended to.
    pub base_url: String,
    /// Last reported health.
    pub health: ServiceHealth,
}

/// Lookup port for registered runtime services.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Returns one registered service by slug.
    async fn find_service(&self, slug: &str) -> AppResult<Option<RegisteredService>>;
}

/// Fully resolved request issued by a service step.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInvocation {
    /// HTTP method, upper case.
    pub method: String,
    /// Path appended to the service base URL.
    pub path: String,
    /// Resolved headers, secret references already substituted.
    pub headers: Vec<(String, String)>,
    /// Resolved query parameters.
    pub query: Vec<(String, String)>,
    /// Optional JSON body.
    pub body: Option<Value>,
    /// Optional request deadline.
    pub timeout_ms: Option<i64>,
}

/// Response captured from a service step call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body, or a string fallback for non-JSON responses.
    pub body: Value,
}

/// HTTP client port used by service steps.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    /// Issues one request against a registered service.
    async fn invoke(
        &self,
        service: &RegisteredService,
        invocation: ServiceInvocation,
    ) -> AppResult<ServiceResponse>;
}

/// Resolver for secret references inside service step headers.
pub trait SecretResolver: Send + Sync {
    /// Resolves one secret by name.
    fn resolve(&self, name: &str) -> AppResult<String>;
}
