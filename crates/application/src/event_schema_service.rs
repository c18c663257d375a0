//! Event schema registry: registration, cached resolution, and envelope
//! annotation.

use std::collections::HashMap;
use std::sync::Arc;

use apphub_core::{AppError, AppResult, Clock};
use apphub_domain::{EventEnvelope, EventSchema, EventSchemaInput, EventSchemaStatus};
use chrono::{DateTime, Duration, Utc};
use jsonschema::Validator;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::warn;

use crate::event_ports::EventSchemaStore;

/// Default TTL for resolved schema cache entries.
pub const SCHEMA_CACHE_TTL_MS: i64 = 60_000;
/// Default TTL for cached resolution misses.
pub const SCHEMA_NEGATIVE_CACHE_TTL_MS: i64 = 10_000;

/// One resolved schema with its compiled validator.
pub struct ResolvedEventSchema {
    /// Resolved schema record.
    pub schema: EventSchema,
    validator: Validator,
}

impl ResolvedEventSchema {
    fn compile(schema: EventSchema) -> AppResult<Self> {
        let validator = jsonschema::validator_for(&schema.schema).map_err(|error| {
            AppError::Validation(format!(
                "event schema '{}' version {} does not compile: {error}",
                schema.event_type, schema.version
            ))
        })?;

        Ok(Self { schema, validator })
    }

    /// Validates one payload against the compiled schema.
    pub fn validate_payload(&self, payload: &Value) -> AppResult<()> {
        if let Err(error) = self.validator.validate(payload) {
            return Err(AppError::Validation(format!(
                "payload does not match schema '{}' version {}: {error}",
                self.schema.event_type, self.schema.version
            )));
        }

        Ok(())
    }
}

struct CacheSlot {
    expires_at: DateTime<Utc>,
    value: Option<Arc<ResolvedEventSchema>>,
}

/// Registry service for event schemas.
pub struct EventSchemaRegistry {
    store: Arc<dyn EventSchemaStore>,
    clock: Arc<dyn Clock>,
    enforce: bool,
    cache_ttl_ms: i64,
    negative_cache_ttl_ms: i64,
    cache: Mutex<HashMap<(String, Option<i32>), CacheSlot>>,
}

impl EventSchemaRegistry {
    /// Creates a registry with default cache TTLs.
    #[must_use]
    pub fn new(store: Arc<dyn EventSchemaStore>, clock: Arc<dyn Clock>, enforce: bool) -> Self {
        Self {
            store,
            clock,
            enforce,
            cache_ttl_ms: SCHEMA_CACHE_TTL_MS,
            negative_cache_ttl_ms: SCHEMA_NEGATIVE_CACHE_TTL_MS,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides cache TTLs.
    #[must_use]
    pub fn with_cache_ttls(mut self, cache_ttl_ms: i64, negative_cache_ttl_ms: i64) -> Self {
        self.cache_ttl_ms = cache_ttl_ms;
        self.negative_cache_ttl_ms = negative_cache_ttl_ms;
        self
    }

    /// Returns whether schema enforcement is enabled by default.
    #[must_use]
    pub fn enforces(&self) -> bool {
        self.enforce
    }

    /// Registers one schema version.
    ///
    /// Re-registering an identical document is idempotent and may transition
    /// status; a different document under an existing `(event_type, version)`
    /// rejects with a conflict. An absent version selects the next integer.
    pub async fn register(&self, input: EventSchemaInput) -> AppResult<EventSchema> {
        input.validate()?;
        let schema_hash = input.schema_hash();
        let event_type = input.event_type.trim().to_owned();

        let version = match input.version {
            Some(version) => version,
            None => self.store.max_version(event_type.as_str()).await?.unwrap_or(0) + 1,
        };

        let record = if let Some(existing) =
            self.store.find_schema(event_type.as_str(), version).await?
        {
            if existing.schema_hash != schema_hash {
                return Err(AppError::Conflict(format!(
                    "event schema '{event_type}' version {version} already exists with a different document"
                )));
            }

            if existing.status != input.status {
                self.store
                    .update_status(event_type.as_str(), version, input.status)
                    .await?;
            }

            EventSchema {
                status: input.status,
                ..existing
            }
        } else {
            let record = EventSchema {
                event_type: event_type.clone(),
                version,
                status: input.status,
                schema: input.schema,
                schema_hash,
                metadata: input.metadata,
            };
            self.store.insert_schema(&record).await?;
            record
        };

        self.invalidate(event_type.as_str()).await;
        Ok(record)
    }

    /// Resolves one schema with a compiled validator.
    ///
    /// Positive entries are cached for `cache_ttl_ms`; misses are cached for
    /// `negative_cache_ttl_ms`. Any registration for the event type
    /// invalidates both.
    pub async fn resolve(
        &self,
        event_type: &str,
        version: Option<i32>,
    ) -> AppResult<Option<Arc<ResolvedEventSchema>>> {
        let key = (event_type.to_owned(), version);
        let now = self.clock.now();

        {
            let cache = self.cache.lock().await;
            if let Some(slot) = cache.get(&key)
                && slot.expires_at > now
            {
                return Ok(slot.value.clone());
            }
        }

        let record = match version {
            Some(version) => self.store.find_schema(event_type, version).await?,
            None => {
                self.store
                    .latest_schema(event_type, &[EventSchemaStatus::Active])
                    .await?
            }
        };

        let resolved = record.map(ResolvedEventSchema::compile).transpose()?.map(Arc::new);

        let ttl_ms = if resolved.is_some() {
            self.cache_ttl_ms
        } else {
            self.negative_cache_ttl_ms
        };

        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CacheSlot {
                expires_at: now + Duration::milliseconds(ttl_ms),
                value: resolved.clone(),
            },
        );

        Ok(resolved)
    }

    /// Validates and annotates one envelope.
    ///
    /// When a schema resolves, the payload is validated and the envelope is
    /// stamped with `schema_version`, `schema_hash`, and a metadata marker.
    /// A claimed version or hash that disagrees with the registry fails
    /// regardless of enforcement. Annotation is idempotent.
    pub async fn annotate(
        &self,
        envelope: EventEnvelope,
        enforce: Option<bool>,
    ) -> AppResult<EventEnvelope> {
        let enforce = enforce.unwrap_or(self.enforce);

        let Some(resolved) = self
            .resolve(envelope.event_type.as_str(), envelope.schema_version)
            .await?
        else {
            return Ok(envelope);
        };

        if let Err(error) = resolved.validate_payload(&envelope.payload) {
            if enforce {
                return Err(error);
            }

            warn!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                error = %error,
                "event payload failed schema validation; enforcement is off"
            );
            return Ok(envelope);
        }

        let payload_hash = envelope.payload_hash();

        if let Some(claimed_version) = envelope.schema_version
            && claimed_version != resolved.schema.version
        {
            return Err(AppError::SchemaMismatch(format!(
                "envelope '{}' claims schema version {claimed_version} but version {} resolved",
                envelope.id, resolved.schema.version
            )));
        }

        if let Some(claimed_hash) = &envelope.schema_hash
            && claimed_hash != &payload_hash
        {
            return Err(AppError::SchemaMismatch(format!(
                "envelope '{}' claims payload hash '{claimed_hash}' but canonical hash is '{payload_hash}'",
                envelope.id
            )));
        }

        let mut metadata = match envelope.metadata {
            Some(Value::Object(entries)) => entries,
            _ => Map::new(),
        };
        metadata.insert(
            "schema".to_owned(),
            json!({"version": resolved.schema.version, "hash": payload_hash}),
        );

        Ok(EventEnvelope {
            schema_version: Some(resolved.schema.version),
            schema_hash: Some(payload_hash),
            metadata: Some(Value::Object(metadata)),
            ..envelope
        })
    }

    async fn invalidate(&self, event_type: &str) {
        let mut cache = self.cache.lock().await;
        cache.retain(|(cached_type, _), _| cached_type != event_type);
    }
}
