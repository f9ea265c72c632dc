use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClickError, IoResultExt, Result};

/// Per-app hook declarations: app name -> hook name -> path relative to the
/// package version directory.
pub type ManifestHooks = BTreeMap<String, BTreeMap<String, String>>;

/// A package manifest as shipped in `.click/info/<name>.manifest`.
///
/// Keys starting with `_` are dynamic, report-only fields and are dropped on
/// parse, so they never round-trip back to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: ManifestHooks,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct HooksOnly {
    #[serde(default)]
    hooks: ManifestHooks,
}

impl Manifest {
    pub fn from_json_str(input: &str) -> std::result::Result<Self, String> {
        let value: Value = serde_json::from_str(input).map_err(|err| err.to_string())?;
        let Value::Object(object) = value else {
            return Err("manifest is not a JSON object".to_string());
        };
        serde_json::from_value(Value::Object(strip_dynamic_keys(object)))
            .map_err(|err| err.to_string())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).at_path(path)?;
        Self::from_json_str(&raw).map_err(|reason| ClickError::BadManifest {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Read only the `hooks` table. Used on paths that must tolerate
    /// manifests without `name`/`version`.
    pub fn read_hooks(path: &Path) -> Result<ManifestHooks> {
        let raw = fs::read_to_string(path).at_path(path)?;
        let parsed: HooksOnly =
            serde_json::from_str(&raw).map_err(|err| ClickError::BadManifest {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        Ok(parsed.hooks)
    }

    /// JSON object form, suitable for reporting. Callers may add
    /// `_`-prefixed fields to the returned map.
    pub fn to_json_object(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(object)) => object,
            _ => Map::new(),
        }
    }
}

pub fn strip_dynamic_keys(mut object: Map<String, Value>) -> Map<String, Value> {
    object.retain(|key, _| !key.starts_with('_'));
    object
}

/// Location of a package's manifest inside its version directory.
pub fn manifest_path(version_dir: &Path, package: &str) -> std::path::PathBuf {
    version_dir
        .join(".click")
        .join("info")
        .join(format!("{package}.manifest"))
}
