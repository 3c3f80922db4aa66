//! Per-entry locking.
//!
//! A cache file is guarded twice: an async mutex serializes tasks inside this
//! process, and an advisory lock on a sibling lock file serializes processes.
//! Both are keyed by the cache file path, so different entries never contend.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fs2::FileExt;
use sha1::{Digest, Sha1};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CacheError, Result};

/// Poll interval while another process holds an entry lock
const CONTENDED_POLL_INTERVAL: Duration = Duration::from_millis(25);

type LockMap = DashMap<PathBuf, Arc<Mutex<()>>>;

/// Hands out [`CacheLock`] guards for cache files
#[derive(Debug)]
pub struct LockRegistry {
    lock_dir: PathBuf,
    in_process: Arc<LockMap>,
}

impl LockRegistry {
    /// Create a registry that keeps its lock files in `lock_dir`
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            in_process: Arc::new(DashMap::new()),
        }
    }

    /// Directory holding the lock files
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Lock file used for `cache_file`
    pub fn lock_file_path(&self, cache_file: &Path) -> PathBuf {
        let digest = Sha1::digest(cache_file.to_string_lossy().as_bytes());
        self.lock_dir.join(format!("{}.lock", hex::encode(digest)))
    }

    /// Acquire the lock for `cache_file`, waiting until every other holder
    /// in this or another process has released it.
    pub async fn acquire(&self, cache_file: &Path, token: &CancellationToken) -> Result<CacheLock> {
        let mutex = self
            .in_process
            .entry(cache_file.to_path_buf())
            .or_default()
            .clone();

        let guard = tokio::select! {
            biased;
            () = token.cancelled() => {
                self.forget_if_idle(cache_file);
                return Err(CacheError::Cancelled);
            }
            guard = mutex.lock_owned() => guard,
        };

        let lock_path = self.lock_file_path(cache_file);
        let file = match open_lock_file(&lock_path) {
            Ok(file) => file,
            Err(source) => {
                drop(guard);
                self.forget_if_idle(cache_file);
                return Err(CacheError::Lock {
                    path: cache_file.to_path_buf(),
                    source,
                });
            }
        };

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    trace!("Waiting for cross-process lock on {}", cache_file.display());
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            drop(guard);
                            self.forget_if_idle(cache_file);
                            return Err(CacheError::Cancelled);
                        }
                        () = tokio::time::sleep(CONTENDED_POLL_INTERVAL) => {}
                    }
                }
                Err(source) => {
                    drop(guard);
                    self.forget_if_idle(cache_file);
                    return Err(CacheError::Lock {
                        path: cache_file.to_path_buf(),
                        source,
                    });
                }
            }
        }

        debug!("Locked cache entry {}", cache_file.display());
        Ok(CacheLock {
            cache_file: cache_file.to_path_buf(),
            file: Some(file),
            guard: Some(guard),
            in_process: Arc::clone(&self.in_process),
        })
    }

    /// Number of entries with an active or pending in-process lock
    pub fn active_locks(&self) -> usize {
        self.in_process.len()
    }

    fn forget_if_idle(&self, cache_file: &Path) {
        self.in_process
            .remove_if(cache_file, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

fn open_lock_file(lock_path: &Path) -> std::io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Exclusive hold on one cache entry, released on drop
#[must_use = "the entry is unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct CacheLock {
    cache_file: PathBuf,
    file: Option<File>,
    guard: Option<OwnedMutexGuard<()>>,
    in_process: Arc<LockMap>,
}

impl CacheLock {
    /// Cache file this lock guards
    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                debug!("Failed to unlock {}: {e}", self.cache_file.display());
            }
        }
        self.guard.take();
        self.in_process
            .remove_if(&self.cache_file, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!("Unlocked cache entry {}", self.cache_file.display());
    }
}
