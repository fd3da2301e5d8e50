//! Cross-invocation operation lock
//!
//! Each invocation is its own OS process. Operations that mutate runtime
//! state hold an exclusive advisory lock on a file in the run directory so
//! two invocations cannot interleave their load-mutate-save cycles.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Held for the duration of one mutating operation; released on drop
#[derive(Debug)]
pub struct OperationLock {
    file: File,
    path: PathBuf,
}

impl OperationLock {
    /// Take the lock without blocking; fails with [`Error::Locked`] when
    /// another invocation holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "OperationLock::acquire: called");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("OperationLock::acquire: acquired");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!("OperationLock::acquire: contended");
                Err(Error::Locked {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "OperationLock released");
    }
}
