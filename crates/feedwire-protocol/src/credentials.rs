//! Credential state shared by the authentication interceptors.
//!
//! Every mutable record carries a version counter. An interceptor reads the
//! version before sending and compares it after a failure: if it moved,
//! somebody else already fixed the credentials and no prompt is needed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Prompts allowed per correlation id before it is blocked
pub const MAX_AUTH_ATTEMPTS: u32 = 4;

/// Username and password for a feed or proxy
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkCredential {
    /// User name
    pub username: String,
    /// Password or personal access token
    pub password: String,
}

impl NetworkCredential {
    /// Create a credential
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for an `Authorization` or `Proxy-Authorization` header
    pub fn basic_auth_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl fmt::Debug for NetworkCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Why credentials are being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialRequestType {
    /// The proxy answered 407
    Proxy,
    /// The feed answered 401
    Unauthorized,
    /// The feed answered 403
    Forbidden,
}

/// Failure reported by a [`CredentialService`] or [`TokenExchange`]
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// The prompt was dismissed or the operation was cancelled
    #[error("Credential request was cancelled")]
    Cancelled,

    /// The provider failed
    #[error("Credential provider failed: {0}")]
    Failed(String),
}

/// Supplies credentials, usually by prompting the user or asking a
/// credential manager
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Ask for credentials for `uri`. `None` means none are available.
    async fn get_credentials(
        &self,
        uri: &Url,
        proxy: Option<&Url>,
        request_type: CredentialRequestType,
        message: &str,
        token: &CancellationToken,
    ) -> Result<Option<NetworkCredential>, CredentialError>;

    /// Credentials that worked earlier for `uri`, served without a prompt
    fn try_get_last_known_good(&self, _uri: &Url, _is_proxy: bool) -> Option<NetworkCredential> {
        None
    }

    /// Called once a request succeeds with credentials obtained from this service
    fn credentials_successfully_used(&self, _uri: &Url, _credentials: &NetworkCredential) {}
}

/// Exchanges a server-advertised endpoint and realm for a federated token
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Request a token. `None` means the endpoint issued nothing.
    async fn request_token(
        &self,
        endpoint: &Url,
        realm: &str,
        token: &CancellationToken,
    ) -> Result<Option<String>, CredentialError>;
}

/// Prompt bookkeeping for one correlation id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthAttemptState {
    /// No more prompts for this scope
    pub is_blocked: bool,
    /// Prompts made so far, saturating at the cap
    pub retry_count: u32,
}

impl AuthAttemptState {
    /// Count one attempt; blocks the scope at [`MAX_AUTH_ATTEMPTS`]
    pub fn increment(&mut self) {
        self.increment_capped(MAX_AUTH_ATTEMPTS);
    }

    /// Count one attempt; blocks the scope once `max_attempts` is reached
    pub fn increment_capped(&mut self, max_attempts: u32) {
        self.retry_count = (self.retry_count + 1).min(max_attempts);
        if self.retry_count >= max_attempts {
            self.is_blocked = true;
        }
    }

    /// Stop prompting for this scope
    pub fn block(&mut self) {
        self.is_blocked = true;
    }
}

/// [`AuthAttemptState`] per correlation id
#[derive(Debug, Default)]
pub struct AuthStateRegistry {
    states: DashMap<Uuid, AuthAttemptState>,
}

impl AuthStateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for `correlation_id`
    pub fn get(&self, correlation_id: Uuid) -> AuthAttemptState {
        self.states
            .get(&correlation_id)
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Mutate the state for `correlation_id` and return the result
    pub fn update<F>(&self, correlation_id: Uuid, f: F) -> AuthAttemptState
    where
        F: FnOnce(&mut AuthAttemptState),
    {
        let mut state = self.states.entry(correlation_id).or_default();
        f(&mut state);
        *state
    }
}

/// The credentials one source currently sends, with a version stamp
#[derive(Debug, Default)]
pub struct SourceCredentials {
    credentials: RwLock<Option<NetworkCredential>>,
    version: AtomicU64,
}

impl SourceCredentials {
    /// Start with `credentials`, if any
    pub fn new(credentials: Option<NetworkCredential>) -> Self {
        Self {
            credentials: RwLock::new(credentials),
            version: AtomicU64::new(0),
        }
    }

    /// Current credentials
    pub fn get(&self) -> Option<NetworkCredential> {
        self.credentials.read().clone()
    }

    /// Replace the credentials and bump the version
    pub fn set(&self, credentials: Option<NetworkCredential>) {
        *self.credentials.write() = credentials;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Version stamp
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// Proxy credentials shared by every source in the process
#[derive(Debug, Default)]
pub struct ProxyCredentialCache {
    credentials: DashMap<String, NetworkCredential>,
    version: AtomicU64,
}

impl ProxyCredentialCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials for `proxy`
    pub fn get(&self, proxy: &Url) -> Option<NetworkCredential> {
        self.credentials.get(&uri_root(proxy)).map(|c| c.clone())
    }

    /// Store credentials for `proxy` and bump the version
    pub fn update(&self, proxy: &Url, credentials: NetworkCredential) {
        self.credentials.insert(uri_root(proxy), credentials);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Version stamp
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// Federated tokens keyed by exact URI and by URI root
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: DashMap<String, String>,
    version: AtomicU64,
}

impl TokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `uri`, trying the exact URI before its root
    pub fn get(&self, uri: &Url) -> Option<String> {
        self.tokens
            .get(uri.as_str())
            .or_else(|| self.tokens.get(&uri_root(uri)))
            .map(|t| t.clone())
    }

    /// Store a token under `uri` and its root, bumping the version
    pub fn add(&self, uri: &Url, token: impl Into<String>) {
        let token = token.into();
        self.tokens.insert(uri_root(uri), token.clone());
        self.tokens.insert(uri.to_string(), token);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Version stamp
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// Scheme, host and port of `uri`
pub fn uri_root(uri: &Url) -> String {
    uri.origin().ascii_serialization()
}

/// Credential collaborators shared by every source in a process.
///
/// Cloning is cheap and clones share state, including the single prompt
/// lock that keeps at most one credential prompt on screen.
#[derive(Clone, Default)]
pub struct CredentialContext {
    service: Option<Arc<dyn CredentialService>>,
    token_exchange: Option<Arc<dyn TokenExchange>>,
    proxy_cache: Arc<ProxyCredentialCache>,
    token_store: Arc<TokenStore>,
    prompt_lock: Arc<Mutex<()>>,
}

impl fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialContext")
            .field("service", &self.service.is_some())
            .field("token_exchange", &self.token_exchange.is_some())
            .field("proxy_cache", &self.proxy_cache)
            .field("token_store", &self.token_store)
            .finish_non_exhaustive()
    }
}

impl CredentialContext {
    /// Context without a credential service; authentication failures are
    /// returned as-is
    pub fn new() -> Self {
        Self::default()
    }

    /// Prompt through `service`
    #[must_use]
    pub fn with_service(mut self, service: Arc<dyn CredentialService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Enable federated tokens through `exchange`
    #[must_use]
    pub fn with_token_exchange(mut self, exchange: Arc<dyn TokenExchange>) -> Self {
        self.token_exchange = Some(exchange);
        self
    }

    /// Credential service, if any
    pub fn service(&self) -> Option<&Arc<dyn CredentialService>> {
        self.service.as_ref()
    }

    /// Token exchange, if any
    pub fn token_exchange(&self) -> Option<&Arc<dyn TokenExchange>> {
        self.token_exchange.as_ref()
    }

    /// Shared proxy credentials
    pub fn proxy_cache(&self) -> &Arc<ProxyCredentialCache> {
        &self.proxy_cache
    }

    /// Shared federated tokens
    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    /// Process-wide prompt lock
    pub fn prompt_lock(&self) -> &Arc<Mutex<()>> {
        &self.prompt_lock
    }
}
