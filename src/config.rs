use crate::core::hash::{DEFAULT_HASH_SIZE, MAX_HASH_SIZE};
use crate::core::migration::{
    DEFAULT_BATCH_SIZE, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_SIMILARITY_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "dhashrs";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_BACKUP_DIR: &str = "backups";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Malformed config {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub batch_size: usize,
    pub similarity_threshold: u32,
    pub confidence_threshold: f64,
    pub retention_days: u32,
    pub hash_size: u32,
    pub backup_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            retention_days: 30,
            hash_size: DEFAULT_HASH_SIZE,
            backup_root: None,
        }
    }
}

impl Config {
    /// `$CONFIG_DIR/dhashrs/config.json`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Explicit file if given, else the default location if it exists,
    /// else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Malformed {
                path: path.display().to_string(),
                source,
            })?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_size",
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid {
                key: "confidence_threshold",
                message: format!("{} is outside [0, 1]", self.confidence_threshold),
            });
        }
        if self.hash_size == 0 || self.hash_size % 4 != 0 || self.hash_size > MAX_HASH_SIZE {
            return Err(ConfigError::Invalid {
                key: "hash_size",
                message: format!(
                    "{} is not a positive multiple of 4 up to {}",
                    self.hash_size, MAX_HASH_SIZE
                ),
            });
        }
        let max_distance = self.hash_size * self.hash_size;
        if self.similarity_threshold > max_distance {
            return Err(ConfigError::Invalid {
                key: "similarity_threshold",
                message: format!(
                    "{} exceeds the {}-bit fingerprint",
                    self.similarity_threshold, max_distance
                ),
            });
        }
        Ok(())
    }

    /// Configured backup root, else `backups` inside the library directory.
    /// `library` may be the library file or that directory itself.
    pub fn backup_root_for(&self, library: &Path) -> PathBuf {
        match &self.backup_root {
            Some(root) => root.clone(),
            None if library.is_dir() => library.join(DEFAULT_BACKUP_DIR),
            None => library_dir(library).join(DEFAULT_BACKUP_DIR),
        }
    }
}

/// Directory holding a library file (`.` for a bare file name).
pub fn library_dir(library: &Path) -> PathBuf {
    match library.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
