// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Host-exclusive session lock.
//!
//! A single lockfile guards a session location against concurrent daemons.
//! The holder keeps an exclusive OS advisory lock on the file for the
//! lifetime of the store and writes its identity (`hostname:+pid`) into it,
//! so a contender can report who owns the session. Because the advisory lock
//! dies with the holding process, a crashed daemon never leaves a lock that
//! has to be cleaned up by hand; the identity in the file is diagnostic.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockfileError {
    /// Another live process holds the lock. Carries the holder identity read
    /// from the lockfile, when one could be read.
    #[error("held by \"{holder}\"")]
    Held { holder: String },

    /// The lock path could not be opened or written.
    #[error("{0}")]
    Path(#[source] io::Error),
}

/// Identity written into the lockfile by the current process.
pub fn holder_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:+{}", host, std::process::id())
}

/// A single-file advisory lock with holder identity.
///
/// With no path set the lock is disabled and always acquires. The lock is
/// released on [`unlock`](Lockfile::unlock) and on drop.
#[derive(Debug, Default)]
pub struct Lockfile {
    path: Option<PathBuf>,
    handle: Option<File>,
}

impl Lockfile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, handle: None }
    }

    /// Set the lock path. Clearing the path disables locking.
    pub fn set_path(&mut self, path: Option<PathBuf>) {
        self.path = path;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.handle.is_some()
    }

    /// Try to acquire the lock without blocking.
    ///
    /// On success the lockfile holds this process's identity. Fails with
    /// [`LockfileError::Held`] when another live process has it, and with
    /// [`LockfileError::Path`] when the file cannot be opened or written.
    pub fn try_lock(&mut self) -> Result<(), LockfileError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        if self.handle.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(LockfileError::Path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(LockfileError::Held {
                    holder: read_identity(&path).unwrap_or_else(|| "<unknown>".to_string()),
                });
            }
            Err(e) => return Err(LockfileError::Path(e)),
        }

        // The lock is ours; stamp our identity over whatever a previous
        // (crashed) holder left behind.
        write_identity(&file).map_err(LockfileError::Path)?;
        self.handle = Some(file);
        Ok(())
    }

    /// Release the lock and remove the lockfile. No-op when not held.
    pub fn unlock(&mut self) {
        if let Some(file) = self.handle.take() {
            if let Some(path) = &self.path {
                let _ = fs::remove_file(path);
            }
            let _ = FileExt::unlock(&file);
        }
    }

    /// Identity of whoever currently holds the lockfile, read from its
    /// contents. `None` when there is no lockfile or it is empty.
    pub fn locked_by(&self) -> Option<String> {
        self.path.as_deref().and_then(read_identity)
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn write_identity(mut file: &File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(holder_identity().as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

fn read_identity(path: &Path) -> Option<String> {
    let mut content = String::new();
    File::open(path).ok()?.read_to_string(&mut content).ok()?;
    let identity = content.trim();
    if identity.is_empty() {
        None
    } else {
        Some(identity.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disabled_lock_always_acquires() {
        let mut lock = Lockfile::new(None);
        assert!(lock.try_lock().is_ok());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_acquire_writes_identity() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("session.lock");
        let mut lock = Lockfile::new(Some(path.clone()));

        lock.try_lock().expect("first lock should succeed");
        assert!(lock.is_locked());

        let identity = lock.locked_by().expect("identity should be readable");
        assert_eq!(identity, holder_identity());
        assert!(identity.contains(":+"));
    }

    #[test]
    fn test_second_holder_is_rejected_with_identity() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("session.lock");

        let mut first = Lockfile::new(Some(path.clone()));
        first.try_lock().expect("first lock should succeed");

        let mut second = Lockfile::new(Some(path));
        match second.try_lock() {
            Err(LockfileError::Held { holder }) => {
                assert_eq!(holder, holder_identity());
            }
            other => panic!("expected Held, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unlock_releases_and_removes_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("session.lock");

        let mut first = Lockfile::new(Some(path.clone()));
        first.try_lock().expect("first lock should succeed");
        first.unlock();
        assert!(!first.is_locked());
        assert!(!path.exists());

        let mut second = Lockfile::new(Some(path));
        assert!(second.try_lock().is_ok());
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("session.lock");

        {
            let mut held = Lockfile::new(Some(path.clone()));
            held.try_lock().expect("lock should succeed");
        }

        let mut next = Lockfile::new(Some(path));
        assert!(next.try_lock().is_ok());
    }

    #[test]
    fn test_stale_file_without_holder_is_reclaimed() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("session.lock");

        // A leftover lockfile from a dead process: contents but no flock.
        fs::write(&path, "otherhost:+4242\n").expect("seed lockfile");

        let mut lock = Lockfile::new(Some(path));
        lock.try_lock().expect("stale lock should be reclaimed");
        assert_eq!(lock.locked_by().expect("identity"), holder_identity());
    }

    #[test]
    fn test_bad_path_reports_path_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("missing").join("session.lock");

        let mut lock = Lockfile::new(Some(path));
        match lock.try_lock() {
            Err(LockfileError::Path(_)) => {}
            other => panic!("expected Path error, got {:?}", other.map(|_| ())),
        }
    }
}
