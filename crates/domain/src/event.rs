use apphub_core::canonical::canonical_hash;
use apphub_core::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of one registered event schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSchemaStatus {
    /// Registered but not yet used for enforcement.
    Draft,
    /// Preferred version for validation.
    Active,
    /// Kept for old envelopes; not selected by default.
    Deprecated,
}

impl EventSchemaStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "deprecated" => Ok(Self::Deprecated),
            _ => Err(AppError::Validation(format!(
                "unknown event schema status '{value}'"
            ))),
        }
    }
}

/// One registered `(eventType, version)` schema record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSchema {
    /// Event type this schema validates.
    pub event_type: String,
    /// Version, unique per event type, starting at 1.
    pub version: i32,
    /// Lifecycle status.
    pub status: EventSchemaStatus,
    /// JSON schema document.
    pub schema: Value,
    /// Canonical hash of the schema document.
    pub schema_hash: String,
    /// Optional registration metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Registration payload for one event schema version.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSchemaInput {
    /// Event type the schema validates.
    pub event_type: String,
    /// Explicit version; absent selects the next integer.
    pub version: Option<i32>,
    /// Initial lifecycle status.
    pub status: EventSchemaStatus,
    /// JSON schema document.
    pub schema: Value,
    /// Optional registration metadata.
    pub metadata: Option<Value>,
}

impl EventSchemaInput {
    /// Validates the registration payload.
    pub fn validate(&self) -> AppResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(AppError::Validation(
                "event schema event_type must not be empty".to_owned(),
            ));
        }

        if let Some(version) = self.version
            && version < 1
        {
            return Err(AppError::Validation(
                "event schema version must be at least 1".to_owned(),
            ));
        }

        if !self.schema.is_object() && !self.schema.is_boolean() {
            return Err(AppError::Validation(
                "event schema document must be a JSON schema object".to_owned(),
            ));
        }

        Ok(())
    }

    /// Returns the canonical hash of the schema document.
    #[must_use]
    pub fn schema_hash(&self) -> String {
        canonical_hash(&self.schema)
    }
}

/// Immutable record of one ingested event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Producer-assigned envelope identifier.
    pub id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producing source identifier.
    pub source: String,
    /// Producer-side occurrence timestamp.
    pub occurred_at: DateTime<Utc>,
    /// Event payload.
    pub payload: Value,
    /// Optional correlation identifier shared across related events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Optional time-to-live in milliseconds.
    #[serde(default, rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<i64>,
    /// Optional metadata object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Schema version stamped by the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i32>,
    /// Canonical payload hash stamped by the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
}

/// Raw submission payload normalized into an [`EventEnvelope`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelopeInput {
    /// Producer-assigned envelope identifier.
    pub id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producing source identifier.
    pub source: String,
    /// Producer-side occurrence timestamp.
    pub occurred_at: DateTime<Utc>,
    /// Event payload.
    pub payload: Value,
    /// Optional correlation identifier.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Optional time-to-live in milliseconds.
    #[serde(default, rename = "ttl")]
    pub ttl_ms: Option<i64>,
    /// Optional metadata object.
    #[serde(default)]
    pub metadata: Option<Value>,
    /// Producer-claimed schema version.
    #[serde(default)]
    pub schema_version: Option<i32>,
    /// Producer-claimed canonical payload hash.
    #[serde(default)]
    pub schema_hash: Option<String>,
}

impl EventEnvelope {
    /// Normalizes a raw submission into a validated envelope.
    ///
    /// Identifier fields are trimmed; empty required fields reject.
    pub fn normalize(input: EventEnvelopeInput) -> AppResult<Self> {
        let EventEnvelopeInput {
            id,
            event_type,
            source,
            occurred_at,
            payload,
            correlation_id,
            ttl_ms,
            metadata,
            schema_version,
            schema_hash,
        } = input;

        let id = id.trim().to_owned();
        if id.is_empty() {
            return Err(AppError::Validation(
                "event envelope id must not be empty".to_owned(),
            ));
        }

        let event_type = event_type.trim().to_owned();
        if event_type.is_empty() {
            return Err(AppError::Validation(
                "event envelope type must not be empty".to_owned(),
            ));
        }

        let source = source.trim().to_owned();
        if source.is_empty() {
            return Err(AppError::Validation(
                "event envelope source must not be empty".to_owned(),
            ));
        }

        if let Some(ttl_ms) = ttl_ms
            && ttl_ms <= 0
        {
            return Err(AppError::Validation(
                "event envelope ttl must be greater than zero".to_owned(),
            ));
        }

        if let Some(metadata) = &metadata
            && !metadata.is_object()
        {
            return Err(AppError::Validation(
                "event envelope metadata must be a JSON object".to_owned(),
            ));
        }

        let correlation_id = correlation_id
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        Ok(Self {
            id,
            event_type,
            source,
            occurred_at,
            payload,
            correlation_id,
            ttl_ms,
            metadata,
            schema_version,
            schema_hash,
        })
    }

    /// Returns the canonical hash of the envelope payload.
    #[must_use]
    pub fn payload_hash(&self) -> String {
        canonical_hash(&self.payload)
    }
}
