//! Environment-backed secret resolver for service step headers.

use std::env;

use apphub_application::SecretResolver;
use apphub_core::{AppError, AppResult};

const SECRET_ENV_PREFIX: &str = "APPHUB_SECRET_";

/// Resolver mapping secret names to `APPHUB_SECRET_<NAME>` variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretResolver;

impl EnvSecretResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn variable_name(name: &str) -> String {
        let sanitized: String = name
            .trim()
            .chars()
            .map(|character| {
                if character.is_ascii_alphanumeric() {
                    character.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{SECRET_ENV_PREFIX}{sanitized}")
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, name: &str) -> AppResult<String> {
        let variable = Self::variable_name(name);
        env::var(variable.as_str())
            .map_err(|_| AppError::NotFound(format!("secret '{name}' is not configured")))
    }
}

#[cfg(test)]
mod tests {
    use super::EnvSecretResolver;

    #[test]
    fn secret_names_map_to_sanitized_variables() {
        assert_eq!(
            EnvSecretResolver::variable_name("catalog-api.token"),
            "APPHUB_SECRET_CATALOG_API_TOKEN"
        );
    }
}
