use apphub_core::canonical::sha256_hex;
use apphub_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime a job bundle targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleRuntime {
    /// Node.js handler entry.
    Node,
    /// Python handler entry.
    Python,
    /// Container image entry.
    Docker,
    /// In-process module entry.
    Module,
}

/// `manifest.json` at the root of a job bundle archive.
///
/// The core treats the bundle itself as an opaque, versioned,
/// checksum-addressed artifact; only the manifest shape is inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBundleManifest {
    /// Bundle name; doubles as the job slug root.
    pub name: String,
    /// Bundle version string.
    pub version: String,
    /// Handler entry point inside the archive.
    pub entry: String,
    /// Target runtime.
    pub runtime: BundleRuntime,
    /// Optional free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Optional declared capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl JobBundleManifest {
    /// Parses and validates a manifest document.
    pub fn parse(document: &str) -> AppResult<Self> {
        let manifest: Self = serde_json::from_str(document).map_err(|error| {
            AppError::Validation(format!("invalid job bundle manifest: {error}"))
        })?;

        if manifest.name.trim().is_empty() {
            return Err(AppError::Validation(
                "job bundle manifest name must not be empty".to_owned(),
            ));
        }

        if manifest.version.trim().is_empty() {
            return Err(AppError::Validation(
                "job bundle manifest version must not be empty".to_owned(),
            ));
        }

        if manifest.entry.trim().is_empty() {
            return Err(AppError::Validation(
                "job bundle manifest entry must not be empty".to_owned(),
            ));
        }

        Ok(manifest)
    }
}

/// Returns the content address of a bundle archive.
#[must_use]
pub fn bundle_checksum(archive: &[u8]) -> String {
    sha256_hex(archive)
}
