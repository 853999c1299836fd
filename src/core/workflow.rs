use crate::config::library_dir;
use crate::core::backup::{BackupError, BackupManifest, BackupStore};
use crate::core::hash::Fingerprinter;
use crate::core::library::{LibraryError, LibraryStore};
use crate::core::lock::PathLock;
use crate::core::migration::{MigrationError, MigrationOrchestrator, MigrationOutcome};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BACKUP_LABEL: &str = "pre-migration";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Library {path} is locked by another operation")]
    LibraryBusy { path: String },

    #[error("Backup of {path} failed: {source}")]
    Backup {
        path: String,
        #[source]
        source: BackupError,
    },

    #[error("Backup {name} failed verification; migration not started")]
    BackupUnverified { name: String },

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct MigrateRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Snapshot the library directory here before touching anything.
    pub backup_root: Option<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct MigrationRun {
    pub outcome: MigrationOutcome,
    pub backup: Option<BackupManifest>,
    /// Whether the migrated document was saved to the output path.
    pub written: bool,
}

impl MigrationRun {
    /// False when any component failed, even though output was written.
    pub fn succeeded(&self) -> bool {
        !self.outcome.report.has_failures()
    }
}

/// Snapshot `source`, refusing to hand back a copy that does not verify.
pub fn verified_snapshot(
    store: &BackupStore,
    source: &Path,
    label: &str,
) -> Result<BackupManifest, WorkflowError> {
    let manifest = store
        .snapshot(source, label)
        .map_err(|source_err| WorkflowError::Backup {
            path: source.display().to_string(),
            source: source_err,
        })?;

    let verified = store.verify(&manifest).map_err(|e| WorkflowError::Backup {
        path: source.display().to_string(),
        source: e,
    })?;
    if !verified {
        return Err(WorkflowError::BackupUnverified {
            name: manifest.backup_name,
        });
    }
    Ok(manifest)
}

/// Lock, back up, load, migrate and save one library file.
///
/// A partial run still saves its output; callers decide the exit status
/// from [`MigrationRun::succeeded`]. A dry run takes no lock, makes no
/// backup and writes nothing.
pub fn migrate_library<F: Fingerprinter>(
    orchestrator: &MigrationOrchestrator<F>,
    request: &MigrateRequest,
) -> Result<MigrationRun, WorkflowError> {
    let _guards = if request.dry_run {
        Vec::new()
    } else {
        lock_library(&request.input)?
    };

    let backup = match &request.backup_root {
        Some(root) if !request.dry_run => {
            let store = BackupStore::new(root);
            Some(verified_snapshot(&store, &library_dir(&request.input), BACKUP_LABEL)?)
        }
        Some(_) => {
            log::info!("Dry run: skipping backup of {}", request.input.display());
            None
        }
        None => None,
    };

    let store = LibraryStore::new();
    let document = store.load_valid(&request.input)?;
    let outcome = orchestrator.migrate(document)?;

    let written = !request.dry_run;
    if written {
        store.save(&outcome.document, &request.output)?;
        log::info!("Wrote {}", request.output.display());
    }

    Ok(MigrationRun {
        outcome,
        backup,
        written,
    })
}

/// The library file's own lock plus its directory's, so a whole-directory
/// rollback sees the migration too.
fn lock_library(input: &Path) -> Result<Vec<PathLock>, WorkflowError> {
    let busy = || WorkflowError::LibraryBusy {
        path: input.display().to_string(),
    };

    let directory_lock = PathLock::directory_lock_path(&library_dir(input))?;
    let directory = PathLock::try_acquire(&directory_lock)?.ok_or_else(busy)?;
    let file = PathLock::try_acquire(&PathLock::library_lock_path(input))?.ok_or_else(busy)?;
    Ok(vec![directory, file])
}
