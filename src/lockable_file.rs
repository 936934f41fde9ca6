//! Guards around the `fs2` flock calls.
//!
//! Move a file handle into a `LockableFile` via From/Into, then call
//! the locking methods on it to get a guard borrowing the handle.

use std::{
    fs::File,
    ops::Deref,
    path::{Path, PathBuf},
};

use fs2::{lock_contended_error, FileExt};
use ouroboros::self_referencing;

pub struct SharedFileLock<'s, F: FileExt> {
    file: &'s F,
}

impl<'s, F: FileExt> Drop for SharedFileLock<'s, F> {
    fn drop(&mut self) {
        self.file
            .unlock()
            .expect("no way another path to unlock exists");
    }
}

impl<'s, F: FileExt> Deref for SharedFileLock<'s, F> {
    type Target = F;

    fn deref(&self) -> &Self::Target {
        self.file
    }
}

#[derive(Debug)]
pub struct ExclusiveFileLock<'s, F: FileExt> {
    file: &'s F,
}

impl<'s, F: FileExt> Drop for ExclusiveFileLock<'s, F> {
    fn drop(&mut self) {
        self.file
            .unlock()
            .expect("no way another path to unlock exists");
    }
}

impl<'s, F: FileExt> Deref for ExclusiveFileLock<'s, F> {
    type Target = F;

    fn deref(&self) -> &Self::Target {
        self.file
    }
}

#[derive(Debug)]
pub struct LockableFile<F: FileExt> {
    file: F,
}

impl<F: FileExt> From<F> for LockableFile<F> {
    fn from(file: F) -> Self {
        Self { file }
    }
}

impl<F: FileExt> LockableFile<F> {
    pub fn lock_shared(&self) -> std::io::Result<SharedFileLock<'_, F>> {
        FileExt::lock_shared(&self.file)?;
        Ok(SharedFileLock { file: &self.file })
    }

    pub fn lock_exclusive(&self) -> std::io::Result<ExclusiveFileLock<'_, F>> {
        FileExt::lock_exclusive(&self.file)?;
        Ok(ExclusiveFileLock { file: &self.file })
    }

    pub fn try_lock_exclusive(&self) -> std::io::Result<Option<ExclusiveFileLock<'_, F>>> {
        match FileExt::try_lock_exclusive(&self.file) {
            Ok(()) => Ok(Some(ExclusiveFileLock { file: &self.file })),
            Err(e) => {
                if e.kind() == lock_contended_error().kind() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl LockableFile<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Ok(File::open(path.as_ref())?.into())
    }

    /// Open for locking, creating the file if it does not exist.
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Ok(File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?
            .into())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StandaloneFileLockError {
    #[error("error locking {path:?}: {error:#}")]
    IOError {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("{msg}: the path {path:?} is already locked")]
    AlreadyLocked { path: PathBuf, msg: String },
}

/// A simple file lock based on `flock`; dropping this type unlocks it
/// and also drops the file handle at the same time.
#[self_referencing]
pub struct StandaloneExclusiveFileLock {
    lockable: LockableFile<File>,
    #[borrows(lockable)]
    #[covariant]
    lock: Option<ExclusiveFileLock<'this, File>>,
}

impl StandaloneExclusiveFileLock {
    /// Create `path` if needed and take the exclusive lock on it. If
    /// the lock is already taken, returns an `AlreadyLocked` error
    /// that includes the result of running `already_locked_msg` as
    /// the first part of the error message.
    pub fn try_lock_path<P: AsRef<Path>>(
        path: P,
        already_locked_msg: impl Fn() -> String,
    ) -> Result<Self, StandaloneFileLockError> {
        let us = (|| -> std::io::Result<_> {
            Self::try_new(LockableFile::create(path.as_ref())?, |file| {
                file.try_lock_exclusive()
            })
        })()
        .map_err(|error| StandaloneFileLockError::IOError {
            path: path.as_ref().to_owned(),
            error,
        })?;
        if us.borrow_lock().is_some() {
            Ok(us)
        } else {
            let msg = already_locked_msg();
            Err(StandaloneFileLockError::AlreadyLocked {
                path: path.as_ref().to_owned(),
                msg,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_second_exclusive_lock_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marker");
        let first =
            StandaloneExclusiveFileLock::try_lock_path(&path, || "first".into()).unwrap();
        match StandaloneExclusiveFileLock::try_lock_path(&path, || "second".into()) {
            Err(StandaloneFileLockError::AlreadyLocked { .. }) => (),
            other => panic!("expected AlreadyLocked, got {:?}", other.is_ok()),
        }
        drop(first);
        StandaloneExclusiveFileLock::try_lock_path(&path, || "third".into()).unwrap();
    }
}
