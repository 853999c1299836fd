use crate::core::hash::DHash;
use crate::core::migration::MigrationSummary;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Library not found: {path}")]
    NotFound { path: String },

    #[error("Malformed library document {path}: {source}")]
    MalformedDocument {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Library failed validation with {} violation(s)", .0.len())]
    Invalid(Vec<SchemaViolation>),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    pub index: usize,
    pub component: String,
    pub field: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.component.is_empty() {
            "<unnamed>"
        } else {
            &self.component
        };
        write!(
            f,
            "components[{}] ({}): {}: {}",
            self.index, label, self.field, self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationSummary>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// `Some(Value::Null)` keeps an explicit `"quantity": null` on save.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub quantity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhash: Option<DHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Component {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// The asset this component points at: `path` when set, else `image`.
    pub fn asset_ref(&self) -> Option<&str> {
        non_empty(self.path.as_deref()).or_else(|| non_empty(self.image.as_deref()))
    }

    pub fn has_image(&self) -> bool {
        non_empty(self.image.as_deref()).is_some()
    }

    pub fn has_long_description(&self) -> bool {
        self.description
            .as_deref()
            .is_some_and(|d| d.chars().count() > 10)
    }

    /// Quantity is a positive number, or a string holding one.
    pub fn has_valid_quantity(&self) -> bool {
        let value = match &self.quantity {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value.is_some_and(|q| q.is_finite() && q > 0.0)
    }

    pub fn is_migrated(&self) -> bool {
        self.dhash.is_some()
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryDocument {
    #[serde(default)]
    pub metadata: LibraryMetadata,
    pub components: Vec<Component>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LibraryDocument {
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Loads, validates and atomically saves library documents.
pub struct LibraryStore;

impl LibraryStore {
    pub fn new() -> Self {
        Self
    }

    pub fn load(&self, path: &Path) -> Result<LibraryDocument, LibraryError> {
        let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LibraryError::NotFound {
                path: path.display().to_string(),
            },
            _ => LibraryError::Io(e),
        })?;

        let document =
            serde_json::from_str(&contents).map_err(|source| LibraryError::MalformedDocument {
                path: path.display().to_string(),
                source,
            })?;

        log::debug!("Loaded library {}", path.display());
        Ok(document)
    }

    /// Load and refuse documents with schema violations.
    pub fn load_valid(&self, path: &Path) -> Result<LibraryDocument, LibraryError> {
        let document = self.load(path)?;
        let violations = self.validate(&document);
        if !violations.is_empty() {
            return Err(LibraryError::Invalid(violations));
        }
        Ok(document)
    }

    /// Collect every schema violation rather than stopping at the first.
    pub fn validate(&self, document: &LibraryDocument) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();

        for (index, component) in document.components.iter().enumerate() {
            if component.name.trim().is_empty() {
                violations.push(SchemaViolation {
                    index,
                    component: component.name.clone(),
                    field: "name".to_string(),
                    message: "component has no identifier".to_string(),
                });
            }

            if component.asset_ref().is_none() {
                violations.push(SchemaViolation {
                    index,
                    component: component.name.clone(),
                    field: "path".to_string(),
                    message: "component has neither a path nor an image reference".to_string(),
                });
            }
        }

        violations
    }

    pub fn save(&self, document: &LibraryDocument, path: &Path) -> Result<(), LibraryError> {
        let mut json = serde_json::to_string_pretty(document)?;
        json.push('\n');
        write_atomic(path, json.as_bytes())?;
        log::info!("Saved library {}", path.display());
        Ok(())
    }
}

impl Default for LibraryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `bytes` to a temp file beside `path`, fsync, then rename over it.
/// The temp file is removed if anything fails before the rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
