//! Per-operation cache settings and cache entry addressing

use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

/// Default freshness window for cached responses
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Cache settings for one logical operation.
///
/// A single context is usually shared by every request made while servicing
/// one user action, so they share a session id and a temp directory.
#[derive(Debug, Clone)]
pub struct CacheContext {
    /// Entries older than this are ignored. Zero selects ephemeral mode.
    pub max_age: Duration,
    /// Stream responses straight from the network without touching the cache
    pub direct_download: bool,
    /// Identifies the logical operation on the wire
    pub session_id: Uuid,
    /// Skip fresh reads and conditional requests but still commit new bodies
    pub refresh: bool,
    /// Directory for ephemeral entries when `max_age` is zero
    pub root_temp_dir: PathBuf,
}

impl CacheContext {
    /// Create a context with the default max age and a new session id
    pub fn new() -> Self {
        let session_id = Uuid::new_v4();
        Self {
            max_age: DEFAULT_MAX_AGE,
            direct_download: false,
            session_id,
            refresh: false,
            root_temp_dir: std::env::temp_dir()
                .join("feedwire")
                .join(session_id.to_string()),
        }
    }

    /// Set the freshness window
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Bypass the shared cache entirely; entries land in `root_temp_dir`
    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.max_age = Duration::ZERO;
        self
    }

    /// Stream responses directly from the network
    #[must_use]
    pub fn with_direct_download(mut self, direct_download: bool) -> Self {
        self.direct_download = direct_download;
        self
    }

    /// Force a network fetch while still refreshing the shared cache
    #[must_use]
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Override the session id
    #[must_use]
    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    /// Override the ephemeral directory
    #[must_use]
    pub fn with_root_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_temp_dir = dir.into();
        self
    }

    /// Whether entries bypass the shared cache directory
    pub fn is_ephemeral(&self) -> bool {
        self.max_age.is_zero()
    }
}

impl Default for CacheContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses of one cached response.
///
/// Produced by [`DiskCache::initialize`](crate::DiskCache::initialize) without
/// touching disk. `new_file` and `cache_file` always differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub(crate) max_age: Duration,
    pub(crate) new_file: PathBuf,
    pub(crate) cache_file: PathBuf,
}

impl CacheEntry {
    /// Freshness window for reads
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Temp file the next body is written into
    pub fn new_file(&self) -> &Path {
        &self.new_file
    }

    /// Committed cache file
    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    /// Whether this entry lives outside the shared cache
    pub fn is_ephemeral(&self) -> bool {
        self.max_age.is_zero()
    }
}
