//! Catalog domain model, identifier extraction and key-set reconciliation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "toolmirror-core";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("malformed record at {location}: {reason}")]
    MalformedRecord { location: String, reason: String },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("remote catalog unavailable: {0}")]
    FetchUnavailable(String),
    #[error("apply failed for {key}: {cause}")]
    ApplyFailure { key: String, cause: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CatalogError {
    pub fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// Names of the key fields on the remote side and the key columns/tables on the local side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub tools_table: String,
    pub versions_table: String,
    pub remote_id_field: String,
    pub local_id_column: String,
    pub version_id_field: String,
    pub version_id_column: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            tools_table: "gmod_tools".to_string(),
            versions_table: "gmod_tools_versions_table".to_string(),
            remote_id_field: "url".to_string(),
            local_id_column: "url".to_string(),
            version_id_field: "url".to_string(),
            version_id_column: "url".to_string(),
        }
    }
}

impl FieldMapping {
    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let mapping: Self =
            serde_yaml::from_str(text).map_err(|err| CatalogError::Config(err.to_string()))?;
        mapping.validate()?;
        Ok(mapping)
    }

    /// Checks that every name is present. Identifier syntax is checked where the
    /// names are turned into SQL.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for (name, value) in [
            ("tools_table", &self.tools_table),
            ("versions_table", &self.versions_table),
            ("remote_id_field", &self.remote_id_field),
            ("local_id_column", &self.local_id_column),
            ("version_id_field", &self.version_id_field),
            ("version_id_column", &self.version_id_column),
        ] {
            if value.trim().is_empty() {
                return Err(CatalogError::Config(format!("{name} must not be empty")));
            }
        }
        if self.tools_table == self.versions_table {
            return Err(CatalogError::Config(
                "tools_table and versions_table must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// One catalog entry as decoded from the remote listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: String,
    pub registry_id: Option<String>,
    pub registry: Option<String>,
    pub organization: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub tool_type: JsonValue,
    pub meta_version: Option<String>,
    pub versions: Vec<VersionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: String,
    /// Key of the owning tool. Lookup only.
    pub parent_tool_id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub descriptor: JsonValue,
    pub dockerfile: JsonValue,
    pub meta_version: Option<String>,
}

/// Stored tool columns read back for the projection service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub key: String,
    pub name: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub registry_id: Option<String>,
}

impl From<&ToolRecord> for ToolSummary {
    fn from(tool: &ToolRecord) -> Self {
        Self {
            key: tool.id.clone(),
            name: tool.name.clone(),
            author: tool.author.clone(),
            description: tool.description.clone(),
            registry_id: tool.registry_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub location: String,
    pub reason: String,
}

/// A descriptive field that was not a string and was converted or dropped.
/// The record itself is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWarning {
    pub location: String,
    pub field: String,
    pub reason: String,
}

/// Decoded remote catalog for a single run.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteSnapshot {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub digest: String,
    pub tools: Vec<ToolRecord>,
    pub skipped: Vec<SkippedRecord>,
    pub warnings: Vec<FieldWarning>,
    /// Version keys listed under a repeated tool key. They stay in the
    /// version key space so stored copies are not removed.
    pub shadowed_version_keys: BTreeSet<String>,
}

impl RemoteSnapshot {
    pub fn tool_keys(&self) -> BTreeSet<String> {
        self.tools.iter().map(|t| t.id.clone()).collect()
    }

    pub fn version_keys(&self) -> BTreeSet<String> {
        self.tools
            .iter()
            .flat_map(|t| t.versions.iter().map(|v| v.id.clone()))
            .chain(self.shadowed_version_keys.iter().cloned())
            .collect()
    }

    /// Distinct version keys in the listing.
    pub fn version_count(&self) -> usize {
        self.version_keys().len()
    }
}

/// Keys present in the local store at the start of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalKeySet {
    pub tools: BTreeSet<String>,
    pub versions: BTreeSet<String>,
}

/// Returns the value of `field` as a non-empty string key.
pub fn extract_key(record: &JsonValue, field: &str, location: &str) -> Result<String, CatalogError> {
    match record.get(field) {
        Some(JsonValue::String(key)) if !key.is_empty() => Ok(key.clone()),
        Some(JsonValue::String(_)) => Err(CatalogError::malformed(
            location,
            format!("identifier field `{field}` is empty"),
        )),
        Some(_) => Err(CatalogError::malformed(
            location,
            format!("identifier field `{field}` is not a string"),
        )),
        None => Err(CatalogError::malformed(
            location,
            format!("identifier field `{field}` is missing"),
        )),
    }
}

pub fn tool_key(record: &JsonValue, mapping: &FieldMapping) -> Result<String, CatalogError> {
    extract_key(record, &mapping.remote_id_field, "tool")
}

pub fn version_key(record: &JsonValue, mapping: &FieldMapping) -> Result<String, CatalogError> {
    extract_key(record, &mapping.version_id_field, "version")
}

/// Reads the first present descriptive field. Scalars of another type are
/// stringified, objects and arrays are dropped; both leave a warning.
fn optional_str(
    record: &JsonValue,
    names: &[&str],
    location: &str,
    warnings: &mut Vec<FieldWarning>,
) -> Option<String> {
    let (name, value) = names
        .iter()
        .filter_map(|name| record.get(*name).map(|value| (*name, value)))
        .find(|(_, value)| !value.is_null())?;
    let warn = |reason: &str| FieldWarning {
        location: location.to_string(),
        field: name.to_string(),
        reason: reason.to_string(),
    };
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => {
            warnings.push(warn("number converted to string"));
            Some(n.to_string())
        }
        JsonValue::Bool(b) => {
            warnings.push(warn("boolean converted to string"));
            Some(b.to_string())
        }
        _ => {
            warnings.push(warn("structured value ignored"));
            None
        }
    }
}

fn payload(record: &JsonValue, names: &[&str]) -> JsonValue {
    names
        .iter()
        .filter_map(|name| record.get(*name))
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(JsonValue::Null)
}

fn decode_version(
    record: &JsonValue,
    parent_tool_id: &str,
    mapping: &FieldMapping,
    location: &str,
    warnings: &mut Vec<FieldWarning>,
) -> Result<VersionRecord, CatalogError> {
    if !record.is_object() {
        return Err(CatalogError::malformed(location, "version is not a JSON object"));
    }
    Ok(VersionRecord {
        id: extract_key(record, &mapping.version_id_field, location)?,
        parent_tool_id: parent_tool_id.to_string(),
        name: optional_str(record, &["name"], location, warnings),
        image: optional_str(record, &["image"], location, warnings),
        descriptor: payload(record, &["descriptor"]),
        dockerfile: payload(record, &["dockerfile"]),
        meta_version: optional_str(record, &["meta-version", "metaVersion"], location, warnings),
    })
}

fn decode_tool(
    record: &JsonValue,
    mapping: &FieldMapping,
    location: &str,
    skipped: &mut Vec<SkippedRecord>,
    warnings: &mut Vec<FieldWarning>,
) -> Result<ToolRecord, CatalogError> {
    if !record.is_object() {
        return Err(CatalogError::malformed(location, "tool is not a JSON object"));
    }
    let id = extract_key(record, &mapping.remote_id_field, location)?;
    let raw_versions = match record.get("versions") {
        None | Some(JsonValue::Null) => &[][..],
        Some(JsonValue::Array(items)) => items.as_slice(),
        Some(_) => {
            warnings.push(FieldWarning {
                location: location.to_string(),
                field: "versions".to_string(),
                reason: "not an array; no versions read".to_string(),
            });
            &[][..]
        }
    };

    let mut tool = ToolRecord {
        registry_id: optional_str(record, &["id"], location, warnings),
        registry: optional_str(record, &["registry"], location, warnings),
        organization: optional_str(record, &["organization"], location, warnings),
        name: optional_str(record, &["toolname", "name"], location, warnings),
        description: optional_str(record, &["description"], location, warnings),
        author: optional_str(record, &["author"], location, warnings),
        tool_type: payload(record, &["tooltype", "toolType"]),
        meta_version: optional_str(record, &["meta-version", "metaVersion"], location, warnings),
        versions: Vec::with_capacity(raw_versions.len()),
        id,
    };

    for (idx, raw) in raw_versions.iter().enumerate() {
        let version_location = format!("{location}.versions[{idx}]");
        match decode_version(raw, &tool.id, mapping, &version_location, warnings) {
            Ok(version) => tool.versions.push(version),
            Err(err) => skipped.push(skipped_from(err, &version_location)),
        }
    }
    Ok(tool)
}

fn skipped_from(err: CatalogError, fallback_location: &str) -> SkippedRecord {
    match err {
        CatalogError::MalformedRecord { location, reason } => SkippedRecord { location, reason },
        other => SkippedRecord {
            location: fallback_location.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Decodes the raw tool listing. Malformed tools and versions are skipped and
/// listed in `skipped`; a repeated tool key keeps the first occurrence.
pub fn decode_snapshot(
    raw_tools: &[JsonValue],
    mapping: &FieldMapping,
    source_url: impl Into<String>,
    fetched_at: DateTime<Utc>,
    digest: impl Into<String>,
) -> RemoteSnapshot {
    let mut tools = Vec::with_capacity(raw_tools.len());
    let mut skipped = Vec::new();
    let mut warnings = Vec::new();
    let mut shadowed_version_keys = BTreeSet::new();
    let mut seen = BTreeSet::new();

    for (idx, raw) in raw_tools.iter().enumerate() {
        let location = format!("tools[{idx}]");
        match decode_tool(raw, mapping, &location, &mut skipped, &mut warnings) {
            Ok(tool) if !seen.insert(tool.id.clone()) => {
                shadowed_version_keys.extend(tool.versions.into_iter().map(|v| v.id));
                skipped.push(SkippedRecord {
                    reason: format!("duplicate identifier `{}`", tool.id),
                    location,
                });
            }
            Ok(tool) => tools.push(tool),
            Err(err) => skipped.push(skipped_from(err, &location)),
        }
    }

    RemoteSnapshot {
        source_url: source_url.into(),
        fetched_at,
        digest: digest.into(),
        tools,
        skipped,
        warnings,
        shadowed_version_keys,
    }
}

/// Add-set and remove-set for one key space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyDiff {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl KeyDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// `to_add = remote - local`, `to_remove = local - remote`.
pub fn reconcile(remote: &BTreeSet<String>, local: &BTreeSet<String>) -> KeyDiff {
    KeyDiff {
        to_add: remote.difference(local).cloned().collect(),
        to_remove: local.difference(remote).cloned().collect(),
    }
}

/// Tool and version diffs, computed independently of each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilePlan {
    pub tools: KeyDiff,
    pub versions: KeyDiff,
}

impl ReconcilePlan {
    pub fn build(snapshot: &RemoteSnapshot, local: &LocalKeySet) -> Self {
        Self {
            tools: reconcile(&snapshot.tool_keys(), &local.tools),
            versions: reconcile(&snapshot.version_keys(), &local.versions),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.versions.is_empty()
    }
}
