//! Disk-backed response cache.
//!
//! Layout: `<root>/<hash(source)>/<sanitized(cache key)>.dat`. Bodies are
//! written to a sibling `-new` file, validated, and swapped in by
//! rename-if-absent so readers never observe a partial file.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use fs2::FileExt;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{CacheContext, CacheEntry};
use crate::error::{CacheError, Result};
use crate::lock::{CacheLock, LockRegistry};
use crate::path::{compute_hash, sanitize_file_name};

/// Validates cached content before it is committed or served.
///
/// The reader is positioned at the start of the file. Returning an error
/// rejects the content.
pub type ContentValidator = Arc<dyn Fn(&mut dyn Read) -> std::result::Result<(), String> + Send + Sync>;

/// Something that happened to a cache entry
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A fresh entry was found
    Hit { path: PathBuf },
    /// No usable entry was found
    Miss { path: PathBuf },
    /// A new body was committed
    Committed { path: PathBuf, bytes: u64 },
    /// Content was rejected by a validator
    Rejected { path: PathBuf, reason: String },
}

/// Receives [`CacheEvent`]s from a [`DiskCache`]
pub trait CacheObserver: Send + Sync {
    /// Called synchronously on the task that produced the event
    fn on_cache_event(&self, event: &CacheEvent);
}

/// An open cache file
#[derive(Debug)]
pub struct CachedFile {
    path: PathBuf,
    file: tokio::fs::File,
    last_modified: SystemTime,
}

impl CachedFile {
    /// Path of the open file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last write time when the file was opened
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// Take the file handle for reading
    pub fn into_file(self) -> tokio::fs::File {
        self.file
    }
}

/// Disk cache rooted at one HTTP cache directory
pub struct DiskCache {
    root: PathBuf,
    locks: LockRegistry,
    observer: Option<Arc<dyn CacheObserver>>,
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("root", &self.root)
            .field("locks", &self.locks)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl DiskCache {
    /// Create a cache rooted at `root`.
    ///
    /// Lock files go to a shared directory under the system temp dir so that
    /// every process agrees on them.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: LockRegistry::new(std::env::temp_dir().join("feedwire").join("locks")),
            observer: None,
        }
    }

    /// Keep lock files in `lock_dir` instead of the default location
    #[must_use]
    pub fn with_lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.locks = LockRegistry::new(lock_dir);
        self
    }

    /// Report cache events to `observer`
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the file paths for a cached response. Never touches disk.
    pub fn initialize(&self, source_uri: &str, cache_key: &str, context: &CacheContext) -> CacheEntry {
        if context.is_ephemeral() {
            return CacheEntry {
                max_age: context.max_age,
                new_file: context.root_temp_dir.join(Uuid::new_v4().to_string()),
                cache_file: context.root_temp_dir.join(Uuid::new_v4().to_string()),
            };
        }

        let directory = self.root.join(sanitize_file_name(&compute_hash(source_uri)));
        let cache_file = directory.join(format!("{}.dat", sanitize_file_name(cache_key)));
        let mut new_file = cache_file.clone().into_os_string();
        new_file.push("-new");

        CacheEntry {
            max_age: context.max_age,
            new_file: PathBuf::from(new_file),
            cache_file,
        }
    }

    /// Take the exclusive lock for an entry
    pub async fn lock(&self, entry: &CacheEntry, token: &CancellationToken) -> Result<CacheLock> {
        self.locks.acquire(&entry.cache_file, token).await
    }

    /// Open the entry if it exists and is younger than its max age.
    ///
    /// Missing, unreadable and stale files all read as `None`.
    pub async fn read(&self, entry: &CacheEntry) -> Result<Option<CachedFile>> {
        if entry.is_ephemeral() {
            return Ok(None);
        }

        let max_age = entry.max_age;
        let found = self
            .open_if(&entry.cache_file, move |modified| match SystemTime::now().duration_since(modified) {
                Ok(age) => age < max_age,
                // Written in the future; treat as fresh.
                Err(_) => true,
            })
            .await?;

        self.notify(&if found.is_some() {
            CacheEvent::Hit {
                path: entry.cache_file.clone(),
            }
        } else {
            CacheEvent::Miss {
                path: entry.cache_file.clone(),
            }
        });
        Ok(found)
    }

    /// Open the entry regardless of its age
    pub async fn read_any(&self, entry: &CacheEntry) -> Result<Option<CachedFile>> {
        if entry.is_ephemeral() {
            return Ok(None);
        }
        self.open_if(&entry.cache_file, |_| true).await
    }

    /// Run `validator` over the file at `path`
    pub async fn validate(&self, path: &Path, validator: &ContentValidator) -> Result<()> {
        let path = path.to_path_buf();
        let validator = Arc::clone(validator);
        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = std::fs::File::open(&path)?;
            validator(&mut file).map_err(|reason| CacheError::ContentValidationFailed { path, reason })
        })
        .await?;

        if let Err(CacheError::ContentValidationFailed { path, reason }) = &result {
            self.notify(&CacheEvent::Rejected {
                path: path.clone(),
                reason: reason.clone(),
            });
        }
        result
    }

    /// Write `body` into the entry and return the committed file opened for
    /// shared reading.
    ///
    /// The body lands in the `-new` file first. If a validator rejects it the
    /// existing cache file is left untouched. The previous cache file is only
    /// replaced when nobody has it open, and the new file is only renamed into
    /// place when the destination is absent.
    pub async fn write<S>(
        &self,
        entry: &CacheEntry,
        body: S,
        validator: Option<&ContentValidator>,
        token: &CancellationToken,
    ) -> Result<CachedFile>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        if let Some(parent) = entry.new_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = match copy_to_file(&entry.new_file, body, token).await {
            Ok(bytes) => bytes,
            Err(e) => {
                discard(&entry.new_file).await;
                return Err(e);
            }
        };

        if let Some(validator) = validator {
            if let Err(e) = self.validate(&entry.new_file, validator).await {
                discard(&entry.new_file).await;
                return Err(e);
            }
        }

        let new_file = entry.new_file.clone();
        let cache_file = entry.cache_file.clone();
        let renamed = tokio::task::spawn_blocking(move || commit(&new_file, &cache_file)).await??;
        if !renamed {
            debug!(
                "Cache file {} was refreshed elsewhere, keeping it",
                entry.cache_file.display()
            );
        }

        self.notify(&CacheEvent::Committed {
            path: entry.cache_file.clone(),
            bytes,
        });

        self.open_if(&entry.cache_file, |_| true)
            .await?
            .ok_or_else(|| {
                CacheError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("committed cache file {} disappeared", entry.cache_file.display()),
                ))
            })
    }

    /// Mark an entry as fresh without rewriting its contents
    pub async fn touch(&self, entry: &CacheEntry) -> Result<()> {
        let path = entry.cache_file.clone();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_modified(SystemTime::now())
        })
        .await??;
        Ok(())
    }

    async fn open_if<F>(&self, path: &Path, accept: F) -> Result<Option<CachedFile>>
    where
        F: FnOnce(SystemTime) -> bool + Send + 'static,
    {
        let path = path.to_path_buf();
        let opened = tokio::task::spawn_blocking(move || open_shared(&path, accept)).await?;
        Ok(opened)
    }

    fn notify(&self, event: &CacheEvent) {
        if let Some(observer) = &self.observer {
            observer.on_cache_event(event);
        }
    }
}

/// Open `path` for reading with a shared advisory lock so writers can tell
/// it is in use. Returns `None` when the file is missing, unreadable or
/// rejected by `accept`.
fn open_shared<F>(path: &Path, accept: F) -> Option<CachedFile>
where
    F: FnOnce(SystemTime) -> bool,
{
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            debug!("Cache file {} is unreadable: {e}", path.display());
            return None;
        }
    };

    let last_modified = file.metadata().and_then(|m| m.modified()).ok()?;
    if !accept(last_modified) {
        return None;
    }

    if let Err(e) = FileExt::try_lock_shared(&file) {
        debug!("Could not share-lock {}: {e}", path.display());
    }

    Some(CachedFile {
        path: path.to_path_buf(),
        file: tokio::fs::File::from_std(file),
        last_modified,
    })
}

async fn copy_to_file<S>(path: &Path, mut body: S, token: &CancellationToken) -> Result<u64>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
{
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await?;

    let mut written = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            () = token.cancelled() => return Err(CacheError::Cancelled),
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            Some(Err(e)) => return Err(CacheError::Io(e)),
            None => break,
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Swap `new_file` into `cache_file`. Returns whether the rename happened.
fn commit(new_file: &Path, cache_file: &Path) -> io::Result<bool> {
    if cache_file.exists() && !is_open_elsewhere(cache_file) {
        if let Err(e) = std::fs::remove_file(cache_file) {
            debug!("Could not remove old cache file {}: {e}", cache_file.display());
        }
    }

    if cache_file.exists() {
        if let Err(e) = std::fs::remove_file(new_file) {
            warn!("Could not remove {}: {e}", new_file.display());
        }
        return Ok(false);
    }

    std::fs::rename(new_file, cache_file)?;
    Ok(true)
}

fn is_open_elsewhere(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return true;
    };
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Could not remove {}: {e}", path.display());
        }
    }
}
