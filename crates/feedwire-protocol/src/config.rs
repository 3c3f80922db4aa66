//! Configuration for HTTP sources

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::credentials::NetworkCredential;
use crate::retry::RetryPolicy;

/// Reads tunables from the environment.
///
/// Injected so tests never have to mutate the process environment.
pub trait EnvReader: Send + Sync {
    /// Value of `name`, if set
    fn var(&self, name: &str) -> Option<String>;

    /// Parsed value of `name`; unparsable values read as unset
    fn parse<T: FromStr>(&self, name: &str) -> Option<T>
    where
        Self: Sized,
    {
        self.var(name).and_then(|s| s.trim().parse().ok())
    }
}

/// Parse a variable through a trait object
pub(crate) fn parse_var<T: FromStr>(env: &dyn EnvReader, name: &str) -> Option<T> {
    env.var(name).and_then(|s| s.trim().parse().ok())
}

/// Reads `std::env`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvReader for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed set of variables, mostly for tests
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvReader for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// A remote package feed
#[derive(Debug, Clone)]
pub struct PackageSource {
    /// Display name used in logs and diagnostics
    pub name: String,
    /// Feed URL
    pub url: Url,
    /// Credentials configured for the feed, applied before any prompt
    pub credentials: Option<NetworkCredential>,
}

impl PackageSource {
    /// Create a source named after its URL
    pub fn new(url: Url) -> Self {
        Self {
            name: url.to_string(),
            url,
            credentials: None,
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set configured credentials
    #[must_use]
    pub fn with_credentials(mut self, credentials: NetworkCredential) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Per-source HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    /// Time allowed for response headers to arrive
    pub request_timeout: Duration,

    /// Longest allowed gap between body chunks
    pub download_timeout: Duration,

    /// Retry policy for failed requests
    pub retry: RetryPolicy,

    /// Redirects followed by the redirect interceptor
    pub max_redirects: usize,

    /// Let the transport follow redirects itself. Disables the redirect
    /// interceptor and its https to http check.
    pub allow_auto_redirect: bool,

    /// Treat 403 like 401 and prompt for credentials
    pub prompt_on_403: bool,

    /// Concurrent exchanges allowed per throttle; 0 disables throttling
    pub max_concurrent_requests: usize,

    /// Root of the shared HTTP cache
    pub http_cache_dir: PathBuf,

    /// Send `If-Modified-Since` for cached entries younger than this window
    pub if_modified_since_window: Option<Duration>,

    /// Install the federated token interceptor
    pub enable_federated_auth: bool,

    /// Proxy for every request
    pub proxy: Option<Url>,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(100),
            download_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            max_redirects: 10,
            allow_auto_redirect: false,
            prompt_on_403: false,
            max_concurrent_requests: 0,
            http_cache_dir: std::env::temp_dir().join("feedwire").join("http-cache"),
            if_modified_since_window: None,
            enable_federated_auth: false,
            proxy: None,
            user_agent: concat!("feedwire/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpSourceConfig {
    /// Defaults overridden by `FEEDWIRE_HTTP_*` variables
    pub fn from_env(env: &dyn EnvReader) -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: parse_var(env, "FEEDWIRE_HTTP_REQUEST_TIMEOUT_SECS")
                .map_or(defaults.request_timeout, Duration::from_secs),
            download_timeout: parse_var(env, "FEEDWIRE_HTTP_DOWNLOAD_TIMEOUT_SECS")
                .map_or(defaults.download_timeout, Duration::from_secs),
            retry: RetryPolicy::from_env(env),
            max_concurrent_requests: parse_var(env, "FEEDWIRE_HTTP_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrent_requests),
            http_cache_dir: env
                .var("FEEDWIRE_HTTP_CACHE_DIR")
                .map_or(defaults.http_cache_dir, PathBuf::from),
            proxy: env
                .var("FEEDWIRE_HTTP_PROXY")
                .and_then(|s| Url::parse(&s).ok())
                .or(defaults.proxy),
            ..defaults
        }
    }

    /// Whether the redirect interceptor is installed
    pub fn manual_redirects(&self) -> bool {
        !self.allow_auto_redirect
    }
}
