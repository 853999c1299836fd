use crate::core::backup::{
    BackupError, BackupManifest, BackupStore, copy_tree, is_store_entry,
};
use crate::core::library::write_atomic;
use crate::core::lock::PathLock;
use dialoguer::Confirm;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("No backup found{}", .reference.as_ref().map(|r| format!(" named {}", r)).unwrap_or_default())]
    NoBackupFound { reference: Option<String> },

    #[error("Backup {name} failed integrity verification; target left untouched")]
    IntegrityCheckFailed { name: String },

    #[error("Rollback aborted by user")]
    UserAborted,

    #[error("Library {path} is locked by another operation")]
    LibraryBusy { path: String },

    #[error("Backup {name} does not contain {path}")]
    MissingInBackup { name: String, path: String },

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Asks whether a destructive step may go ahead.
pub trait Confirmer {
    fn confirm(&self, prompt: &str) -> io::Result<bool>;
}

/// Interactive yes/no prompt on the terminal, defaulting to "no".
pub struct DialoguerConfirmer;

impl Confirmer for DialoguerConfirmer {
    fn confirm(&self, prompt: &str) -> io::Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

pub struct AlwaysConfirm;

impl Confirmer for AlwaysConfirm {
    fn confirm(&self, _prompt: &str) -> io::Result<bool> {
        Ok(true)
    }
}

pub struct NeverConfirm;

impl Confirmer for NeverConfirm {
    fn confirm(&self, _prompt: &str) -> io::Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub backup_name: String,
    pub restored: PathBuf,
    pub files_restored: usize,
}

pub struct RollbackEngine<C: Confirmer> {
    store: BackupStore,
    confirmer: C,
    force: bool,
}

impl<C: Confirmer> RollbackEngine<C> {
    pub fn new(store: BackupStore, confirmer: C) -> Self {
        Self {
            store,
            confirmer,
            force: false,
        }
    }

    /// Skip the confirmation prompt.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Restore `target` (a library file or a whole directory) from a backup.
    ///
    /// Without `backup_ref` the most recent backup is used. The backup is
    /// verified before anything on disk is touched.
    pub fn rollback(
        &self,
        target: &Path,
        backup_ref: Option<&str>,
    ) -> Result<RollbackOutcome, RollbackError> {
        let manifest = self.select_backup(backup_ref)?;

        if !self.store.verify(&manifest)? {
            return Err(RollbackError::IntegrityCheckFailed {
                name: manifest.backup_name,
            });
        }

        let restore_dir = target.is_dir();
        let source = if restore_dir {
            manifest.backup_directory.clone()
        } else {
            self.locate_file(&manifest, target)?
        };

        let _guards = self.lock_target(target, restore_dir)?;

        if !self.force {
            let prompt = format!(
                "Restore {} from backup {} (created {}, {} file(s))? Current contents will be overwritten",
                target.display(),
                manifest.backup_name,
                manifest.created_at.to_rfc3339(),
                manifest.file_count
            );
            if !self.confirmer.confirm(&prompt)? {
                log::info!("Rollback of {} declined", target.display());
                return Err(RollbackError::UserAborted);
            }
        }

        let files_restored = if restore_dir {
            self.restore_directory(&source, target)?;
            manifest.file_count
        } else {
            let bytes = fs::read(&source)?;
            write_atomic(target, &bytes)?;
            1
        };

        log::info!(
            "Restored {} from backup {}",
            target.display(),
            manifest.backup_name
        );
        Ok(RollbackOutcome {
            backup_name: manifest.backup_name,
            restored: target.to_path_buf(),
            files_restored,
        })
    }

    fn select_backup(&self, backup_ref: Option<&str>) -> Result<BackupManifest, RollbackError> {
        match backup_ref {
            Some(name) => self.store.find(name).map_err(|e| match e {
                BackupError::NotFound { name } => RollbackError::NoBackupFound {
                    reference: Some(name),
                },
                other => RollbackError::Backup(other),
            }),
            None => self
                .store
                .latest()?
                .ok_or(RollbackError::NoBackupFound { reference: None }),
        }
    }

    /// The snapshot copy of `target`: same position relative to the backed-up
    /// directory, else the same file name at the snapshot root.
    fn locate_file(
        &self,
        manifest: &BackupManifest,
        target: &Path,
    ) -> Result<PathBuf, RollbackError> {
        let absolute = absolute_path(target)?;
        let candidate = match absolute.strip_prefix(&manifest.source_directory) {
            Ok(relative) => manifest.backup_directory.join(relative),
            Err(_) => manifest
                .backup_directory
                .join(target.file_name().unwrap_or_default()),
        };

        if !candidate.is_file() {
            return Err(RollbackError::MissingInBackup {
                name: manifest.backup_name.clone(),
                path: target.display().to_string(),
            });
        }
        Ok(candidate)
    }

    /// Locks held for the whole restore. A directory target also takes every
    /// lock file inside it, so a migration of any library in the tree keeps
    /// the rollback out.
    fn lock_target(
        &self,
        target: &Path,
        restore_dir: bool,
    ) -> Result<Vec<PathLock>, RollbackError> {
        let busy = |path: &Path| RollbackError::LibraryBusy {
            path: path.display().to_string(),
        };

        if !restore_dir {
            let guard = PathLock::try_acquire(&PathLock::library_lock_path(target))?
                .ok_or_else(|| busy(target))?;
            return Ok(vec![guard]);
        }

        let mut guards = vec![
            PathLock::try_acquire(&PathLock::directory_lock_path(target)?)?
                .ok_or_else(|| busy(target))?,
        ];
        for entry in WalkDir::new(target).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            let is_lock = entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "lock");
            if is_lock {
                let guard = PathLock::try_acquire(entry.path())?.ok_or_else(|| busy(target))?;
                guards.push(guard);
            }
        }
        Ok(guards)
    }

    /// Swap `target` for a fresh copy of `snapshot`. Backup store entries
    /// living inside `target` are carried over into the new tree.
    fn restore_directory(&self, snapshot: &Path, target: &Path) -> Result<(), RollbackError> {
        let carried = self.store_entries_in(target)?;

        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let staging = TempDir::new_in(parent)?;
        let fresh = staging.path().join("restored");
        copy_tree(snapshot, &fresh, |_| false)?;

        let retired = staging.path().join("retired");
        fs::rename(target, &retired)?;

        for relative in &carried {
            let destination = fresh.join(relative);
            if let Some(dir) = destination.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::rename(retired.join(relative), &destination)?;
        }

        if let Err(e) = fs::rename(&fresh, target) {
            log::error!(
                "Failed to swap in restored tree, putting the old one back: {}",
                e
            );
            for relative in &carried {
                fs::rename(fresh.join(relative), retired.join(relative))?;
            }
            fs::rename(&retired, target)?;
            return Err(e.into());
        }

        Ok(())
    }

    /// Paths, relative to `target`, of the backup store entries inside it: the
    /// whole root when it is nested, or the root's own entries when the root
    /// is `target` itself.
    fn store_entries_in(&self, target: &Path) -> Result<Vec<PathBuf>, RollbackError> {
        let target = target.canonicalize()?;
        let Ok(root) = self.store.root().canonicalize() else {
            return Ok(Vec::new());
        };

        if root == target {
            let mut entries = Vec::new();
            for entry in fs::read_dir(&root)? {
                let path = entry?.path();
                if is_store_entry(&root, &path) {
                    if let Some(name) = path.file_name() {
                        entries.push(PathBuf::from(name));
                    }
                }
            }
            return Ok(entries);
        }

        Ok(root
            .strip_prefix(&target)
            .ok()
            .map(Path::to_path_buf)
            .into_iter()
            .collect())
    }
}

/// Absolute, symlink-resolved path; works for files that do not exist yet.
fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    if path.exists() {
        return path.canonicalize();
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.canonicalize()?,
        _ => std::env::current_dir()?,
    };
    Ok(parent.join(path.file_name().unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingConfirmer {
        answer: bool,
        prompts: Mutex<Vec<String>>,
    }

    impl Confirmer for RecordingConfirmer {
        fn confirm(&self, prompt: &str) -> io::Result<bool> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.answer)
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        library_dir: PathBuf,
        library: PathBuf,
        store: BackupStore,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let library_dir = temp_dir.path().join("library");
        fs::create_dir_all(library_dir.join("img")).unwrap();
        let library = library_dir.join("library.json");
        fs::write(&library, b"{\"components\": [\"original\"]}").unwrap();
        fs::write(library_dir.join("img/a.png"), b"aaaa").unwrap();
        let store = BackupStore::new(temp_dir.path().join("backups"));

        Fixture {
            _temp_dir: temp_dir,
            library_dir,
            library,
            store,
        }
    }

    #[test]
    fn test_rollback_restores_latest_backup() {
        let f = fixture();
        let manifest = f.store.snapshot(&f.library_dir, "pre").unwrap();
        fs::write(&f.library, b"{\"components\": [\"migrated\"]}").unwrap();

        let confirmer = RecordingConfirmer {
            answer: true,
            prompts: Mutex::new(Vec::new()),
        };
        let engine = RollbackEngine::new(f.store.clone(), confirmer);
        let outcome = engine.rollback(&f.library, None).unwrap();

        assert_eq!(outcome.backup_name, manifest.backup_name);
        assert_eq!(outcome.files_restored, 1);
        assert_eq!(
            fs::read(&f.library).unwrap(),
            b"{\"components\": [\"original\"]}"
        );
        let prompts = engine.confirmer.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains(&manifest.backup_name));
    }

    #[test]
    fn test_declined_rollback_leaves_target_unchanged() {
        let f = fixture();
        f.store.snapshot(&f.library_dir, "pre").unwrap();
        fs::write(&f.library, b"migrated bytes").unwrap();

        let engine = RollbackEngine::new(f.store.clone(), NeverConfirm);
        let result = engine.rollback(&f.library, None);

        assert!(matches!(result, Err(RollbackError::UserAborted)));
        assert_eq!(fs::read(&f.library).unwrap(), b"migrated bytes");
    }

    #[test]
    fn test_force_skips_confirmation() {
        let f = fixture();
        f.store.snapshot(&f.library_dir, "pre").unwrap();
        fs::write(&f.library, b"migrated bytes").unwrap();

        let engine = RollbackEngine::new(f.store.clone(), NeverConfirm).with_force(true);
        engine.rollback(&f.library, None).unwrap();

        assert_eq!(
            fs::read(&f.library).unwrap(),
            b"{\"components\": [\"original\"]}"
        );
    }

    #[test]
    fn test_tampered_backup_is_refused() {
        let f = fixture();
        let manifest = f.store.snapshot(&f.library_dir, "pre").unwrap();
        fs::write(manifest.backup_directory.join("library.json"), b"tampered").unwrap();
        fs::write(&f.library, b"current").unwrap();

        let engine = RollbackEngine::new(f.store.clone(), AlwaysConfirm).with_force(true);
        let result = engine.rollback(&f.library, None);

        assert!(matches!(result, Err(RollbackError::IntegrityCheckFailed { .. })));
        assert_eq!(fs::read(&f.library).unwrap(), b"current");
    }

    #[test]
    fn test_no_backup_found() {
        let f = fixture();
        let engine = RollbackEngine::new(f.store.clone(), AlwaysConfirm);

        assert!(matches!(
            engine.rollback(&f.library, None),
            Err(RollbackError::NoBackupFound { reference: None })
        ));
        assert!(matches!(
            engine.rollback(&f.library, Some("missing")),
            Err(RollbackError::NoBackupFound { reference: Some(_) })
        ));
    }

    #[test]
    fn test_explicit_backup_reference() {
        let f = fixture();
        let first = f.store.snapshot(&f.library_dir, "first").unwrap();
        fs::write(&f.library, b"second state").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(15));
        f.store.snapshot(&f.library_dir, "second").unwrap();
        fs::write(&f.library, b"third state").unwrap();

        let engine = RollbackEngine::new(f.store.clone(), AlwaysConfirm);
        engine.rollback(&f.library, None).unwrap();
        assert_eq!(fs::read(&f.library).unwrap(), b"second state");

        engine.rollback(&f.library, Some(&first.backup_name)).unwrap();
        assert_eq!(
            fs::read(&f.library).unwrap(),
            b"{\"components\": [\"original\"]}"
        );
    }

    #[test]
    fn test_restores_deleted_library_file() {
        let f = fixture();
        f.store.snapshot(&f.library_dir, "pre").unwrap();
        fs::remove_file(&f.library).unwrap();

        RollbackEngine::new(f.store.clone(), AlwaysConfirm)
            .rollback(&f.library, None)
            .unwrap();
        assert!(f.library.is_file());
    }

    #[test]
    fn test_busy_library_is_not_touched() {
        let f = fixture();
        f.store.snapshot(&f.library_dir, "pre").unwrap();
        fs::write(&f.library, b"mid-migration").unwrap();

        let _migration = PathLock::acquire(&PathLock::library_lock_path(&f.library)).unwrap();
        let result = RollbackEngine::new(f.store.clone(), AlwaysConfirm)
            .with_force(true)
            .rollback(&f.library, None);

        assert!(matches!(result, Err(RollbackError::LibraryBusy { .. })));
        assert_eq!(fs::read(&f.library).unwrap(), b"mid-migration");
    }

    #[test]
    fn test_directory_rollback_waits_for_library_inside() {
        let temp_dir = TempDir::new().unwrap();
        let library_dir = temp_dir.path().join("library");
        fs::create_dir_all(&library_dir).unwrap();
        let library = library_dir.join("library.json");
        fs::write(&library, b"v1").unwrap();
        let store = BackupStore::new(temp_dir.path().join("backups"));
        store.snapshot(&library_dir, "pre").unwrap();
        fs::write(&library, b"mid-migration").unwrap();

        let _migration = PathLock::acquire(&PathLock::library_lock_path(&library)).unwrap();
        let result = RollbackEngine::new(store.clone(), AlwaysConfirm)
            .with_force(true)
            .rollback(&library_dir, None);

        assert!(matches!(result, Err(RollbackError::LibraryBusy { .. })));
        assert_eq!(fs::read(&library).unwrap(), b"mid-migration");
    }

    #[test]
    fn test_directory_rollback_waits_for_directory_lock() {
        let temp_dir = TempDir::new().unwrap();
        let library_dir = temp_dir.path().join("library");
        fs::create_dir_all(&library_dir).unwrap();
        fs::write(library_dir.join("library.json"), b"v1").unwrap();
        let store = BackupStore::new(temp_dir.path().join("backups"));
        store.snapshot(&library_dir, "pre").unwrap();

        let lock_path = PathLock::directory_lock_path(&library_dir).unwrap();
        let _held = PathLock::acquire(&lock_path).unwrap();
        let result = RollbackEngine::new(store, AlwaysConfirm).rollback(&library_dir, None);
        assert!(matches!(result, Err(RollbackError::LibraryBusy { .. })));
    }

    #[test]
    fn test_directory_rollback_with_root_in_place() {
        let temp_dir = TempDir::new().unwrap();
        let library_dir = temp_dir.path().join("library");
        fs::create_dir_all(&library_dir).unwrap();
        fs::write(library_dir.join("library.json"), b"v1").unwrap();
        let store = BackupStore::new(&library_dir);
        let manifest = store.snapshot(&library_dir, "pre").unwrap();

        fs::write(library_dir.join("library.json"), b"v2").unwrap();
        fs::write(library_dir.join("stray.txt"), b"new").unwrap();

        RollbackEngine::new(store.clone(), AlwaysConfirm)
            .rollback(&library_dir, None)
            .unwrap();

        assert_eq!(fs::read(library_dir.join("library.json")).unwrap(), b"v1");
        assert!(!library_dir.join("stray.txt").exists());
        let kept = store.find(&manifest.backup_name).unwrap();
        assert!(store.verify(&kept).unwrap());
    }

    #[test]
    fn test_directory_rollback_replaces_tree_and_keeps_backups() {
        let temp_dir = TempDir::new().unwrap();
        let library_dir = temp_dir.path().join("library");
        fs::create_dir_all(&library_dir).unwrap();
        fs::write(library_dir.join("library.json"), b"v1").unwrap();
        let store = BackupStore::new(library_dir.join("backups"));
        let manifest = store.snapshot(&library_dir, "pre").unwrap();

        fs::write(library_dir.join("library.json"), b"v2").unwrap();
        fs::write(library_dir.join("stray.txt"), b"new").unwrap();

        let outcome = RollbackEngine::new(store.clone(), AlwaysConfirm)
            .rollback(&library_dir, None)
            .unwrap();

        assert_eq!(outcome.files_restored, 1);
        assert_eq!(fs::read(library_dir.join("library.json")).unwrap(), b"v1");
        assert!(!library_dir.join("stray.txt").exists());
        // the nested backup store survived the swap
        assert!(store.verify(&store.find(&manifest.backup_name).unwrap()).unwrap());
    }
}
