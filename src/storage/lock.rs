//! Exclusive advisory lock on a storage root.
//!
//! A root is owned by one process at a time. The lock is an `flock` on
//! `<root>/.lock` and is released when the [`RootLock`] is dropped. On
//! non-unix targets the lock file is created but not locked.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::error::StoreError;

pub const LOCK_FILE_NAME: &str = ".lock";

#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, "open lock", e))?;

        lock_exclusive(&file)
            .map_err(|e| StoreError::io(&path, "lock", e))
            .wrap_err_with(|| {
                format!(
                    "storage root '{}' is already in use by another store",
                    root.display()
                )
            })?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: flock only reads the descriptor, which is owned by `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: as above; failure leaves the lock to be dropped with the fd.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let lock = RootLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let _held = RootLock::acquire(dir.path()).unwrap();

        assert!(RootLock::acquire(dir.path()).is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        drop(RootLock::acquire(dir.path()).unwrap());

        assert!(RootLock::acquire(dir.path()).is_ok());
    }
}
