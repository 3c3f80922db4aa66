//! # feedwire-protocol - HTTP transport for package feeds
//!
//! This crate is the network layer between a package manager and its
//! feeds. Every request to a source goes through the same stack:
//!
//! ```text
//! HttpSource::get ──> DiskCache (fresh entry? serve it)
//!        │
//!        ▼
//! Throttle slot ──> RetryExecutor ──> HandlerPipeline ──> Transport
//!                    (attempts,        (redirect, credentials,
//!                     timeouts)         federated token, proxy,
//!                                       server warnings)
//! ```
//!
//! ## Features
//!
//! - **Disk caching**: responses are committed atomically per
//!   `(source, cache key)` and served without a round trip while fresh.
//!   Conditional `If-Modified-Since` requests revalidate recent entries.
//! - **Retries**: transport failures, request timeouts and 5xx responses
//!   are retried with a fixed delay. Caller cancellation never is.
//! - **Stalled downloads**: bodies that stop producing bytes fail with a
//!   timeout instead of hanging.
//! - **Credentials**: 401 (and optionally 403) responses prompt through a
//!   [`CredentialService`], at most four times per operation and one prompt
//!   at a time per process. Proxy 407s are handled the same way.
//! - **Safe redirects**: https to http redirects are refused and the
//!   `Authorization` header is never forwarded.
//! - **Throttling**: a shared [`Throttle`] bounds concurrent exchanges.
//! - **Diagnostics**: request, cache and download events go to an optional
//!   [`DiagnosticsSink`]; [`HttpMetrics`] exports them to Prometheus.
//!
//! ## Example
//!
//! ```rust,no_run
//! use feedwire_protocol::{CacheContext, CachedRequest, HttpSource, HttpSourceConfig, PackageSource};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let feed = Url::parse("https://api.nuget.org/v3/index.json")?;
//!     let source = HttpSource::new(PackageSource::new(feed.clone()), HttpSourceConfig::default());
//!
//!     let request = CachedRequest::new(feed, "service_index", CacheContext::new())
//!         .with_accept("application/json");
//!     let body = source
//!         .get(request, |result| result.read_to_end(), &CancellationToken::new())
//!         .await?;
//!
//!     println!("{} bytes", body.len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod credentials;
pub mod diagnostics;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod throttle;
pub mod transport;

// Re-export main types
pub use config::{EnvReader, HttpSourceConfig, MapEnv, PackageSource, ProcessEnv};
pub use credentials::{
    CredentialContext, CredentialError, CredentialRequestType, CredentialService, NetworkCredential,
    TokenExchange,
};
pub use diagnostics::{DiagnosticEvent, Diagnostics, DiagnosticsSink, EventLog, RequestEvent};
pub use error::{ProtocolError, Result};
pub use message::{HttpRequest, HttpResponse, RequestOptions, SESSION_ID_HEADER};
pub use metrics::HttpMetrics;
pub use pipeline::{HandlerPipeline, Interceptor, Next};
pub use retry::{RetryExecutor, RetryPolicy, RetryRequest};
pub use source::{
    BodyReader, CachedRequest, HttpSource, HttpSourceRequest, HttpSourceResult, HttpSourceResultStatus,
};
pub use throttle::{NullThrottle, SemaphoreThrottle, Throttle, ThrottledResponse, throttle_for};
pub use transport::{ReqwestTransport, ReqwestTransportFactory, Transport, TransportFactory};

// Cache types used in requests
pub use feedwire_cache::{CacheContext, ContentValidator, DiskCache};
