//! Disk-backed HTTP response cache for package feeds
//!
//! Responses are stored one file per `(source, cache key)` pair:
//!
//! ```text
//! <http cache dir>/
//! └── <sha1(source uri) reversed hex>$<uri tail>/
//!     ├── <cache key>.dat        committed entry
//!     └── <cache key>.dat-new    body being written
//! ```
//!
//! # Guarantees
//!
//! - **Atomic commits**: bodies are written to the `-new` sibling, validated,
//!   then renamed into place. Readers never see a partial file.
//! - **One writer per entry**: [`DiskCache::lock`] serializes tasks in this
//!   process and, through an advisory lock file, other processes too.
//! - **Open files are never deleted**: a cache file somebody is still reading
//!   is kept and the fresh body is dropped instead.
//! - **Ephemeral mode**: a zero max age places entries under the operation's
//!   temp directory instead of the shared cache.
//!
//! # Example
//!
//! ```rust,no_run
//! use feedwire_cache::{CacheContext, DiskCache};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), feedwire_cache::CacheError> {
//! let cache = DiskCache::new("/var/cache/feedwire/http");
//! let context = CacheContext::new();
//! let entry = cache.initialize("https://api.example.org/v3/index.json", "index", &context);
//!
//! let token = CancellationToken::new();
//! let _lock = cache.lock(&entry, &token).await?;
//! if let Some(hit) = cache.read(&entry).await? {
//!     println!("fresh entry at {}", hit.path().display());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod context;
pub mod disk;
pub mod error;
pub mod lock;
pub mod path;

pub use context::{CacheContext, CacheEntry, DEFAULT_MAX_AGE};
pub use disk::{CacheEvent, CacheObserver, CachedFile, ContentValidator, DiskCache};
pub use error::{CacheError, Result};
pub use lock::{CacheLock, LockRegistry};
pub use path::{compute_hash, sanitize_file_name};
