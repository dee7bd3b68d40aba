//! Filesystem-based locking for cross-process coordination
//!
//! Two processes syncing the same repository would race on contributor
//! inserts and batch commits. An exclusive `flock()` on a per-repository lock
//! file prevents that; the in-process side lives in `run_lock.rs`.

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lock file for a repository key inside `lock_dir`
pub(crate) fn lock_file_path(lock_dir: &Path, key: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    lock_dir.join(format!("{}.lock", &hash[..16]))
}

/// Guard that holds an exclusive filesystem lock
///
/// Released when dropped. If the process dies the OS releases the flock.
pub struct FsLockGuard {
    _file: File,
    path: PathBuf,
}

impl FsLockGuard {
    /// Try to take the lock for `key` without blocking
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(lock_dir: &Path, key: &str) -> Result<Option<Self>> {
        let lock_path = lock_file_path(lock_dir, key);

        fs::create_dir_all(lock_dir).context("Failed to create lock directory")?;
        let file = File::create(&lock_path).context("Failed to create lock file")?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired run lock for {} ({:?})", key, lock_path);
                Ok(Some(Self {
                    _file: file,
                    path: lock_path,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::debug!("Run lock for {} is held elsewhere", key);
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to acquire filesystem lock"),
        }
    }

    /// Poll for the lock until `timeout` elapses; `Ok(None)` on timeout
    pub fn acquire_blocking(lock_dir: &Path, key: &str, timeout: Duration) -> Result<Option<Self>> {
        let start = Instant::now();

        loop {
            if let Some(guard) = Self::try_acquire(lock_dir, key)? {
                if start.elapsed() > POLL_INTERVAL {
                    tracing::info!("Acquired run lock for {} after {:?}", key, start.elapsed());
                }
                return Ok(Some(guard));
            }
            if start.elapsed() >= timeout {
                tracing::warn!(
                    "Timed out after {:?} waiting for the run lock on {}",
                    timeout,
                    key
                );
                return Ok(None);
            }
            if start.elapsed() < POLL_INTERVAL {
                tracing::info!("Waiting for another process syncing {}", key);
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FsLockGuard {
    fn drop(&mut self) {
        // Closing the file releases the lock; the file itself is reused
        tracing::debug!("Releasing run lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let key = "/repos/alpha";

        let guard = FsLockGuard::try_acquire(dir.path(), key).unwrap();
        assert!(guard.is_some());
        drop(guard);

        let again = FsLockGuard::try_acquire(dir.path(), key).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_second_holder_is_refused() {
        let dir = TempDir::new().unwrap();
        let key = "/repos/beta";
        let first = FsLockGuard::try_acquire(dir.path(), key).unwrap();
        assert!(first.is_some());

        let lock_dir = dir.path().to_path_buf();
        let handle =
            thread::spawn(move || FsLockGuard::try_acquire(&lock_dir, "/repos/beta").unwrap());
        assert!(handle.join().unwrap().is_none());

        drop(first);
        assert!(FsLockGuard::try_acquire(dir.path(), key).unwrap().is_some());
    }

    #[test]
    fn test_blocking_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let _held = FsLockGuard::try_acquire(dir.path(), "/repos/gamma")
            .unwrap()
            .unwrap();

        let lock_dir = dir.path().to_path_buf();
        let handle = thread::spawn(move || {
            FsLockGuard::acquire_blocking(&lock_dir, "/repos/gamma", Duration::from_millis(100))
                .unwrap()
        });
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn test_lock_file_path_per_key() {
        let dir = Path::new("/locks");
        let a = lock_file_path(dir, "/repos/a");
        let b = lock_file_path(dir, "/repos/b");
        assert_ne!(a, b);
        assert_eq!(a, lock_file_path(dir, "/repos/a"));
        assert!(a.to_string_lossy().ends_with(".lock"));
    }
}
