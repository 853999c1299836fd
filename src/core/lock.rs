use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on a sidecar file. Released on drop.
#[derive(Debug)]
pub struct PathLock {
    file: File,
    path: PathBuf,
}

impl PathLock {
    /// Block until the lock at `lock_path` is ours.
    pub fn acquire(lock_path: &Path) -> io::Result<Self> {
        let file = Self::open(lock_path)?;
        file.lock_exclusive()?;
        log::debug!("Acquired lock {}", lock_path.display());
        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody else holds it.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: lock_path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lock file guarding a library document: `<library>.lock`.
    pub fn library_lock_path(library: &Path) -> PathBuf {
        let mut name = library
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        library.with_file_name(name)
    }

    /// Lock file guarding a whole library directory: `<dir>.lock` beside it.
    pub fn directory_lock_path(dir: &Path) -> io::Result<PathBuf> {
        Ok(Self::library_lock_path(&dir.canonicalize()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(lock_path: &Path) -> io::Result<File> {
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
