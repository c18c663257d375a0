//! Static service registry seeded from configuration.

use std::collections::HashMap;

use apphub_application::{RegisteredService, ServiceHealth, ServiceRegistry};
use apphub_core::{AppError, AppResult};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    slug: String,
    #[serde(rename = "baseUrl")]
    base_url: String,
    #[serde(default)]
    health: Option<String>,
}

/// In-memory implementation of the service registry port.
///
/// The registry collaborator proper lives outside the core; this adapter
/// mirrors its lookup contract from a static configuration document.
#[derive(Default)]
pub struct InMemoryServiceRegistry {
    services: RwLock<HashMap<String, RegisteredService>>,
}

impl InMemoryServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a JSON array of
    /// `{slug, baseUrl, health?}` entries.
    pub fn from_json(document: &str) -> AppResult<Self> {
        let entries: Vec<ServiceEntry> = serde_json::from_str(document).map_err(|error| {
            AppError::Validation(format!("invalid service registry document: {error}"))
        })?;

        let mut services = HashMap::with_capacity(entries.len());
        for entry in entries {
            let health = match entry.health.as_deref() {
                Some(value) => ServiceHealth::parse(value)?,
                None => ServiceHealth::Healthy,
            };

            services.insert(
                entry.slug.clone(),
                RegisteredService {
                    slug: entry.slug,
                    base_url: entry.base_url.trim_end_matches('/').to_owned(),
                    health,
                },
            );
        }

        Ok(Self {
            services: RwLock::new(services),
        })
    }

    /// Inserts or replaces one service entry.
    pub async fn upsert(&self, service: RegisteredService) {
        self.services.write().await.insert(service.slug.clone(), service);
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn find_service(&self, slug: &str) -> AppResult<Option<RegisteredService>> {
        Ok(self.services.read().await.get(slug).cloned())
    }
}

#[cfg(test)]
mod tests {
    use apphub_application::{ServiceHealth, ServiceRegistry};

    use super::InMemoryServiceRegistry;

    #[tokio::test]
    async fn registry_parses_configuration_documents() {
        let registry = InMemoryServiceRegistry::from_json(
            r#"[{"slug": "catalog", "baseUrl": "http://catalog.internal/", "health": "degraded"}]"#,
        );
        let Ok(registry) = registry else {
            panic!("registry must parse");
        };

        let service = registry.find_service("catalog").await;
        let Ok(Some(service)) = service else {
            panic!("catalog must resolve");
        };
        assert_eq!(service.base_url, "http://catalog.internal");
        assert_eq!(service.health, ServiceHealth::Degraded);
    }

    #[tokio::test]
    async fn unknown_services_resolve_to_none() {
        let registry = InMemoryServiceRegistry::new();
        let service = registry.find_service("missing").await;
        assert!(matches!(service, Ok(None)));
    }
}
