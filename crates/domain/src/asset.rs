use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Returns the canonical lookup form of an asset identifier.
#[must_use]
pub fn normalize_asset_id(asset_id: &str) -> String {
    asset_id.trim().to_lowercase()
}

/// Returns the canonical lookup form of an optional partition key.
///
/// Unpartitioned snapshots share the empty-string slot.
#[must_use]
pub fn normalize_partition_key(partition_key: Option<&str>) -> String {
    partition_key
        .map(|key| key.trim().to_lowercase())
        .unwrap_or_default()
}

/// Freshness expectations for a produced asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessPolicy {
    /// Maximum tolerated age before the asset counts as stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<i64>,
    /// Hard expiry after which `asset.expired` fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<i64>,
    /// Expected production cadence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence_ms: Option<i64>,
}

/// Granularity of a time-window partitioned asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowGranularity {
    /// Keys shaped `YYYY-MM-DDTHH:MM`.
    Minute,
    /// Keys shaped `YYYY-MM-DDTHH`.
    Hour,
    /// Keys shaped `YYYY-MM-DD`.
    Day,
    /// Keys shaped `YYYY-MM-DD` snapped to the ISO week start.
    Week,
    /// Keys shaped `YYYY-MM`.
    Month,
}

/// Partitioning scheme declared for an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetPartitioning {
    /// Fixed enumeration of partition keys.
    Static {
        /// Allowed partition keys.
        keys: Vec<String>,
    },
    /// Time-window partitions keyed by a formatted timestamp.
    TimeWindow {
        /// Window granularity; absent when only opaque keys are known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        granularity: Option<WindowGranularity>,
    },
    /// Caller-defined partition keys.
    Dynamic,
}

/// Auto-materialization behavior declared for an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutoMaterializePolicy {
    /// Re-run the producing workflow when a consumed upstream updates.
    #[serde(default)]
    pub on_upstream_update: bool,
    /// Relative scheduling priority for enqueued auto runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Parameter overrides merged into auto-run parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameter_defaults: Value,
}

/// Asset produced by a workflow step, as declared in the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDeclaration {
    /// Declared asset identifier; all lookups use the normalized form.
    pub asset_id: String,
    /// Optional JSON schema describing the asset payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Optional freshness expectations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<FreshnessPolicy>,
    /// Optional partitioning scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitioning: Option<AssetPartitioning>,
    /// Optional auto-materialization behavior.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_materialize: Option<AutoMaterializePolicy>,
}

impl AssetDeclaration {
    /// Returns the normalized asset identifier.
    #[must_use]
    pub fn normalized_id(&self) -> String {
        normalize_asset_id(self.asset_id.as_str())
    }

    /// Returns whether productions of this asset require a partition key.
    #[must_use]
    pub fn is_partitioned(&self) -> bool {
        self.partitioning.is_some()
    }
}

/// Upstream asset consumed by a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetConsumption {
    /// Consumed asset identifier.
    pub asset_id: String,
}

impl AssetConsumption {
    /// Returns the normalized asset identifier.
    #[must_use]
    pub fn normalized_id(&self) -> String {
        normalize_asset_id(self.asset_id.as_str())
    }
}

/// Inclusive start / exclusive end bounds derived from a partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWindow {
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end.
    pub end: DateTime<Utc>,
}

/// Derives window bounds from a time-window partition key.
///
/// Returns `None` when the key does not parse under the granularity; keys
/// without a known granularity carry no window.
#[must_use]
pub fn partition_window(granularity: WindowGranularity, partition_key: &str) -> Option<PartitionWindow> {
    let key = partition_key.trim();
    let (start, end) = match granularity {
        WindowGranularity::Minute => {
            let start = NaiveDateTime::parse_from_str(key, "%Y-%m-%dT%H:%M").ok()?;
            (start, start + Duration::minutes(1))
        }
        WindowGranularity::Hour => {
            let start =
                NaiveDateTime::parse_from_str(format!("{key}:00").as_str(), "%Y-%m-%dT%H:%M")
                    .ok()?;
            (start, start + Duration::hours(1))
        }
        WindowGranularity::Day => {
            let date = NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()?;
            let start = date.and_time(NaiveTime::MIN);
            (start, start + Duration::days(1))
        }
        WindowGranularity::Week => {
            let date = NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()?;
            let offset = i64::from(date.weekday().num_days_from_monday());
            let start = (date - Duration::days(offset)).and_time(NaiveTime::MIN);
            (start, start + Duration::weeks(1))
        }
        WindowGranularity::Month => {
            let date = NaiveDate::parse_from_str(format!("{key}-01").as_str(), "%Y-%m-%d").ok()?;
            let start = date.and_time(NaiveTime::MIN);
            let next = if date.month() == 12 {
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)?
            };
            (start, next.and_time(NaiveTime::MIN))
        }
    };

    Some(PartitionWindow {
        start: Utc.from_utc_datetime(&start),
        end: Utc.from_utc_datetime(&end),
    })
}

/// One asset record extracted from a step result.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedAsset {
    /// Asset identifier as reported by the step.
    pub asset_id: String,
    /// Optional partition key reported by the step.
    pub partition_key: Option<String>,
    /// Optional production timestamp reported by the step.
    pub produced_at: Option<DateTime<Utc>>,
    /// Optional payload schema reported by the step.
    pub schema: Option<Value>,
    /// Optional freshness override reported by the step.
    pub freshness: Option<FreshnessPolicy>,
    /// Asset payload.
    pub payload: Value,
}

const PRODUCED_ASSET_KEYS: [&str; 10] = [
    "assetId",
    "asset_id",
    "partitionKey",
    "partition_key",
    "producedAt",
    "produced_at",
    "schema",
    "freshness",
    "payload",
    "assets",
];

/// Extracts produced-asset records from a raw step result.
///
/// Accepts `{assets: [...]}`, a bare array of records, or a single record
/// object carrying an `assetId`. Records without an asset id are ignored.
#[must_use]
pub fn extract_produced_assets(result: &Value) -> Vec<ProducedAsset> {
    let records: Vec<&Value> = match result {
        Value::Object(entries) => match entries.get("assets") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ if record_asset_id(result).is_some() => vec![result],
            _ => Vec::new(),
        },
        Value::Array(items) => items.iter().collect(),
        _ => Vec::new(),
    };

    records
        .into_iter()
        .filter_map(|record| parse_produced_asset(record))
        .collect()
}

fn parse_produced_asset(record: &Value) -> Option<ProducedAsset> {
    let entries = record.as_object()?;
    let asset_id = record_asset_id(record)?;

    let partition_key = string_field(entries, "partitionKey", "partition_key");
    let produced_at = string_field(entries, "producedAt", "produced_at")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.as_str()).ok())
        .map(|parsed| parsed.with_timezone(&Utc));
    let schema = entries.get("schema").cloned().filter(|value| !value.is_null());
    let freshness = entries
        .get("freshness")
        .and_then(|value| serde_json::from_value::<FreshnessPolicy>(value.clone()).ok());

    let payload = match entries.get("payload") {
        Some(payload) => payload.clone(),
        None => {
            let mut remainder = Map::new();
            for (key, value) in entries {
                if !PRODUCED_ASSET_KEYS.contains(&key.as_str()) {
                    remainder.insert(key.clone(), value.clone());
                }
            }
            Value::Object(remainder)
        }
    };

    Some(ProducedAsset {
        asset_id,
        partition_key,
        produced_at,
        schema,
        freshness,
        payload,
    })
}

fn record_asset_id(record: &Value) -> Option<String> {
    let entries = record.as_object()?;
    string_field(entries, "assetId", "asset_id").filter(|value| !value.trim().is_empty())
}

fn string_field(entries: &Map<String, Value>, key: &str, alias: &str) -> Option<String> {
    entries
        .get(key)
        .or_else(|| entries.get(alias))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}
