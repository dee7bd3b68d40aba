//! Per-repository run serialization
//!
//! Two layers:
//! 1. In-process: one async mutex per repository path, so runs in the same
//!    engine queue behind each other instead of failing.
//! 2. Cross-process: a filesystem lock (see `fs_lock.rs`), bounded by the
//!    configured wait timeout.

use super::fs_lock::FsLockGuard;
use crate::error::{IngestError, SyncError};
use crate::paths::PlatformPaths;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

type Slots = Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>;

fn slots(map: &Slots) -> MutexGuard<'_, HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of repository locks shared by every run of one engine
#[derive(Clone)]
pub struct RunLocks {
    lock_dir: PathBuf,
    slots: Slots,
}

impl RunLocks {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take the lock for the repository at `path`
    ///
    /// Waits for other runs of this engine without a bound; waits at most
    /// `timeout` for a run in another process, then fails with
    /// [`IngestError::RunInProgress`].
    pub async fn acquire(&self, path: &Path, timeout: Duration) -> Result<RunLockGuard, SyncError> {
        let key = PlatformPaths::absolute(path);

        let slot = slots(&self.slots)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        if slot.try_lock().is_err() {
            tracing::info!("Waiting for the running sync of {}", key.display());
        }
        let held = slot.lock_owned().await;

        // Built before the fs lock so an error below still frees the slot
        let mut guard = RunLockGuard {
            key: key.clone(),
            slots: self.slots.clone(),
            held: Some(held),
            _fs_lock: None,
        };

        let lock_dir = self.lock_dir.clone();
        let lock_key = key.to_string_lossy().into_owned();
        let fs_lock = tokio::task::spawn_blocking(move || {
            FsLockGuard::acquire_blocking(&lock_dir, &lock_key, timeout)
        })
        .await
        .map_err(|e| IngestError::WorkerFailed(e.to_string()))??;

        match fs_lock {
            Some(fs_lock) => {
                guard._fs_lock = Some(fs_lock);
                Ok(guard)
            }
            None => Err(IngestError::RunInProgress(key.display().to_string()).into()),
        }
    }

    /// Number of repositories with a queued or running sync
    pub fn active(&self) -> usize {
        slots(&self.slots).len()
    }
}

/// Held for the lifetime of one run; dropping it lets the next run proceed
pub struct RunLockGuard {
    key: PathBuf,
    slots: Slots,
    held: Option<OwnedMutexGuard<()>>,
    _fs_lock: Option<FsLockGuard>,
}

impl RunLockGuard {
    pub fn key(&self) -> &Path {
        &self.key
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.held.take();
        let mut map = slots(&self.slots);
        // Waiters clone the slot under the map lock, so a count of one
        // means nobody else is queued
        if map
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            map.remove(&self.key);
        }
    }
}
