//! # Non-destructive merge into the integration configuration
//!
//! The integration file belongs to another program and may have been edited by
//! hand. It is handled as a generic JSON tree so unknown content round-trips
//! untouched; only the entries of one top-level section are typed
//! ([ServerEntry]). Entries are added when their key is missing and left alone
//! otherwise. A file which can't be parsed is never rewritten.
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    #[error("{path} is not valid JSON ({reason}), merge the entries manually")]
    Unparseable { path: PathBuf, reason: String },
    #[error("{path} does not hold a JSON object at the top level, merge the entries manually")]
    NotAnObject { path: PathBuf },
    #[error("Section {section} of {path} is not a JSON object, merge the entries manually")]
    SectionNotAnObject { path: PathBuf, section: String },
    #[error("Could not access {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Could not serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One entry of the recognized section, describing how a client reaches a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Environment of the command, credentials are left as placeholders
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// What a merge did to the document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// The file didn't exist and was written from scratch
    pub created: bool,
    pub added: Vec<String>,
    /// Keys which were already present and were kept as they are
    pub kept: Vec<String>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.created || !self.added.is_empty()
    }
}

/// Convert typed entries into the JSON values to merge
pub fn entries_to_values(
    entries: &BTreeMap<String, ServerEntry>,
) -> Result<Map<String, Value>, MergeError> {
    let mut values = Map::new();
    for (key, entry) in entries {
        values.insert(key.clone(), serde_json::to_value(entry)?);
    }
    Ok(values)
}

/// Add every key of `desired` missing from `section` of the document at `path`
#[instrument(skip(desired), fields(path = %path.display()))]
pub fn merge(path: &Path, section: &str, desired: &Map<String, Value>) -> Result<MergeReport, MergeError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(MergeError::Io(path.to_path_buf(), e)),
    };

    let Some(content) = content else {
        let mut root = Map::new();
        root.insert(section.to_string(), Value::Object(desired.clone()));
        write_document(path, &Value::Object(root), false)?;
        info!("Created {} with {} entries", path.display(), desired.len());
        return Ok(MergeReport {
            created: true,
            added: desired.keys().cloned().collect(),
            kept: Vec::new(),
        });
    };

    let mut document: Value = if content.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(&content).map_err(|e| MergeError::Unparseable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    let report = augment(&mut document, section, desired).map_err(|e| match e {
        AugmentError::NotAnObject => MergeError::NotAnObject {
            path: path.to_path_buf(),
        },
        AugmentError::SectionNotAnObject => MergeError::SectionNotAnObject {
            path: path.to_path_buf(),
            section: section.to_string(),
        },
    })?;

    if report.added.is_empty() {
        debug!("Nothing to add, leaving the file untouched");
    } else {
        write_document(path, &document, true)?;
        info!("Added {} entries to {}", report.added.len(), path.display());
    }
    Ok(report)
}

#[derive(Debug, PartialEq, Eq)]
enum AugmentError {
    NotAnObject,
    SectionNotAnObject,
}

fn augment(document: &mut Value, section: &str, desired: &Map<String, Value>) -> Result<MergeReport, AugmentError> {
    let root = document.as_object_mut().ok_or(AugmentError::NotAnObject)?;
    let entries = root
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or(AugmentError::SectionNotAnObject)?;

    let mut report = MergeReport::default();
    for (key, value) in desired {
        if entries.contains_key(key) {
            report.kept.push(key.clone());
        } else {
            entries.insert(key.clone(), value.clone());
            report.added.push(key.clone());
        }
    }
    Ok(report)
}

fn write_document(path: &Path, document: &Value, backup: bool) -> Result<(), MergeError> {
    let io = |p: &Path, e| MergeError::Io(p.to_path_buf(), e);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io(parent, e))?;
    }
    if backup {
        let backup_path = sibling(path, "bak");
        fs::copy(path, &backup_path).map_err(|e| io(&backup_path, e))?;
        debug!("Previous version kept at {}", backup_path.display());
    }
    let mut serialized = serde_json::to_string_pretty(document)?;
    serialized.push('\n');
    let tmp = sibling(path, "tmp");
    fs::write(&tmp, serialized).map_err(|e| io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io(path, e))?;
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
