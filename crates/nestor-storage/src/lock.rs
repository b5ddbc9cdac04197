//! Exclusive-writer enforcement via an OS-level file lock on a sidecar
//! file in the data directory.

use std::path::{Path, PathBuf};

use fslock::LockFile;

use crate::error::{Result, StorageError};

/// Name of the sidecar lock file, relative to the data directory.
pub const LOCK_FILE_NAME: &str = ".nestor.lock";

/// An acquired exclusive writer lock. Released on drop.
pub struct WriterLock {
    path: PathBuf,
    file: LockFile,
}

impl WriterLock {
    /// Attempts to acquire the writer lock for `data_directory`.
    ///
    /// # Errors
    /// Returns [`StorageError::StorageLocked`] if another process already
    /// holds the lock.
    pub fn acquire(data_directory: &Path) -> Result<Self> {
        let path = data_directory.join(LOCK_FILE_NAME);
        let mut file = LockFile::open(&path).map_err(|e| StorageError::io(&path, e))?;
        let acquired = file.try_lock().map_err(|e| StorageError::io(&path, e))?;
        if !acquired {
            return Err(StorageError::StorageLocked { path });
        }
        Ok(Self { path, file })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release writer lock");
        }
    }
}
