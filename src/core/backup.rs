use crate::core::library::write_atomic;
use crate::core::lock::PathLock;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

const MANIFEST_SUFFIX: &str = ".manifest.json";
const LOCK_FILE: &str = ".backup.lock";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Source directory does not exist: {path}")]
    SourceMissing { path: String },

    #[error("Backup not found: {name}")]
    NotFound { name: String },

    #[error("Malformed backup manifest {path}: {source}")]
    MalformedManifest {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub hash: String,
}

/// Sidecar describing one immutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_name: String,
    pub label: String,
    pub timestamp: String,
    pub source_directory: PathBuf,
    pub backup_directory: PathBuf,
    pub sha256_hash: String,
    pub file_count: usize,
    pub created_at: DateTime<Utc>,
    pub manifest: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneFailure {
    pub backup_name: String,
    pub snapshot_removed: bool,
    pub manifest_removed: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub failed: Vec<PruneFailure>,
}

impl PruneReport {
    pub fn is_consistent(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Root directory holding snapshots and their manifests.
///
/// Snapshot and prune hold an exclusive lock on the root, so concurrent
/// callers (threads or processes) are serialized.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<PathLock, BackupError> {
        fs::create_dir_all(&self.root)?;
        Ok(PathLock::acquire(&self.root.join(LOCK_FILE))?)
    }

    fn manifest_path(&self, backup_name: &str) -> PathBuf {
        self.root.join(format!("{}{}", backup_name, MANIFEST_SUFFIX))
    }

    /// Copy `source` into a timestamped snapshot and write its manifest.
    pub fn snapshot(&self, source: &Path, label: &str) -> Result<BackupManifest, BackupError> {
        if !source.is_dir() {
            return Err(BackupError::SourceMissing {
                path: source.display().to_string(),
            });
        }

        let _guard = self.lock()?;
        let source = source.canonicalize()?;
        let root = self.root.canonicalize()?;

        let created_at = Utc::now();
        let timestamp = created_at.format("%Y%m%d_%H%M%S_%3f").to_string();
        let label = sanitize_label(label);
        let backup_name = self.unique_name(&format!("{}_{}", label, timestamp));
        let backup_directory = root.join(&backup_name);

        log::info!(
            "Creating backup {} of {}",
            backup_name,
            source.display()
        );

        let nested_root = root != source && root.starts_with(&source);
        let skip = |path: &Path| {
            path.starts_with(&backup_directory)
                || (nested_root && path.starts_with(&root))
                || (root == source && is_store_entry(&root, path))
        };
        if let Err(e) = copy_tree(&source, &backup_directory, skip) {
            if let Err(cleanup) = fs::remove_dir_all(&backup_directory) {
                log::warn!(
                    "Failed to remove partial snapshot {}: {}",
                    backup_directory.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        let entries = digest_tree(&backup_directory)?;
        let manifest = BackupManifest {
            backup_name: backup_name.clone(),
            label,
            timestamp,
            source_directory: source,
            backup_directory,
            sha256_hash: combined_digest(&entries),
            file_count: entries.len(),
            created_at,
            manifest: entries,
        };

        let json = serde_json::to_string_pretty(&manifest)?;
        write_atomic(&self.manifest_path(&backup_name), json.as_bytes())?;

        log::info!(
            "Backup {} holds {} file(s), sha256 {}",
            backup_name,
            manifest.file_count,
            manifest.sha256_hash
        );
        Ok(manifest)
    }

    fn unique_name(&self, base: &str) -> String {
        let mut name = base.to_string();
        let mut counter = 1;
        while self.root.join(&name).exists() || self.manifest_path(&name).exists() {
            name = format!("{}_{}", base, counter);
            counter += 1;
        }
        name
    }

    /// Recompute the snapshot digest and compare with the manifest.
    pub fn verify(&self, manifest: &BackupManifest) -> Result<bool, BackupError> {
        if !manifest.backup_directory.is_dir() {
            log::warn!(
                "Backup {} is missing its snapshot directory {}",
                manifest.backup_name,
                manifest.backup_directory.display()
            );
            return Ok(false);
        }

        let entries = digest_tree(&manifest.backup_directory)?;
        if entries.len() != manifest.file_count {
            log::warn!(
                "Backup {} file count changed: expected {}, found {}",
                manifest.backup_name,
                manifest.file_count,
                entries.len()
            );
            return Ok(false);
        }

        if combined_digest(&entries) != manifest.sha256_hash {
            let changed: Vec<&str> = entries
                .iter()
                .filter(|e| !manifest.manifest.contains(e))
                .map(|e| e.path.as_str())
                .collect();
            log::warn!(
                "Backup {} failed verification; changed: {:?}",
                manifest.backup_name,
                changed
            );
            return Ok(false);
        }

        Ok(true)
    }

    /// All manifests under the root, newest first.
    pub fn list(&self) -> Result<Vec<BackupManifest>, BackupError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut manifests = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_manifest = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
            if !is_manifest {
                continue;
            }

            match read_manifest(&path) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => log::warn!("Skipping unreadable manifest: {}", e),
            }
        }

        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(manifests)
    }

    pub fn latest(&self) -> Result<Option<BackupManifest>, BackupError> {
        Ok(self.list()?.into_iter().next())
    }

    pub fn find(&self, backup_name: &str) -> Result<BackupManifest, BackupError> {
        let path = self.manifest_path(backup_name);
        if !path.is_file() {
            return Err(BackupError::NotFound {
                name: backup_name.to_string(),
            });
        }
        read_manifest(&path)
    }

    /// Delete every backup older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<PruneReport, BackupError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.prune_before(cutoff)
    }

    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, BackupError> {
        let _guard = self.lock()?;
        let mut report = PruneReport::default();

        for manifest in self.list()? {
            if manifest.created_at >= cutoff {
                continue;
            }

            let name = manifest.backup_name.clone();
            match self.remove_backup(&manifest) {
                Ok(()) => {
                    log::info!("Pruned backup {}", name);
                    report.removed.push(name);
                }
                Err(failure) => {
                    log::error!(
                        "Backup {} left inconsistent: snapshot removed={}, manifest removed={}: {}",
                        name,
                        failure.snapshot_removed,
                        failure.manifest_removed,
                        failure.error
                    );
                    report.failed.push(failure);
                }
            }
        }

        Ok(report)
    }

    /// Snapshot first, then manifest; a snapshot that cannot be removed
    /// keeps its manifest so it stays listed.
    fn remove_backup(&self, manifest: &BackupManifest) -> Result<(), PruneFailure> {
        let failure = |snapshot_removed: bool, error: io::Error| PruneFailure {
            backup_name: manifest.backup_name.clone(),
            snapshot_removed,
            manifest_removed: false,
            error: error.to_string(),
        };

        if manifest.backup_directory.exists() {
            fs::remove_dir_all(&manifest.backup_directory).map_err(|e| failure(false, e))?;
        }
        fs::remove_file(self.manifest_path(&manifest.backup_name)).map_err(|e| failure(true, e))?;
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Result<BackupManifest, BackupError> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|source| BackupError::MalformedManifest {
        path: path.display().to_string(),
        source,
    })
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned
    }
}

/// Whether `path`, a direct child of `root`, belongs to the store itself:
/// the lock file, a manifest sidecar, or a snapshot directory with one.
pub(crate) fn is_store_entry(root: &Path, path: &Path) -> bool {
    if path.parent() != Some(root) {
        return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name == LOCK_FILE
        || name.ends_with(MANIFEST_SUFFIX)
        || root.join(format!("{}{}", name, MANIFEST_SUFFIX)).is_file()
}

/// Recursively copy `source` into `dest`, leaving out every subtree `skip`
/// accepts.
pub(crate) fn copy_tree(
    source: &Path,
    dest: &Path,
    skip: impl Fn(&Path) -> bool,
) -> Result<(), BackupError> {
    fs::create_dir_all(dest)?;

    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !skip(e.path()));

    for entry in walker {
        let entry = entry?;
        let relative = match entry.path().strip_prefix(source) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            log::warn!("Skipping non-regular file {}", entry.path().display());
        }
    }

    Ok(())
}

/// Per-file SHA-256 digests, sorted by `/`-separated relative path.
pub fn digest_tree(dir: &Path) -> Result<Vec<ManifestEntry>, BackupError> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        entries.push(ManifestEntry {
            path: relative,
            hash: file_digest(entry.path())?,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// SHA-256 over the `path:hash\n` lines of already sorted entries.
pub fn combined_digest(entries: &[ManifestEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(format!("{}:{}\n", entry.path, entry.hash).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn file_digest(path: &Path) -> Result<String, BackupError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
