//! Innermost HTTP handler.
//!
//! [`Transport`] sends one request and returns one response with no retries,
//! auth or redirects of its own; those are layered on top by the handler
//! pipeline. [`TransportFactory`] builds it lazily, once per source.

use std::error::Error as _;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, ClientBuilder, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::HttpSourceConfig;
use crate::error::{ProtocolError, Result};
use crate::message::{HttpRequest, HttpResponse};

/// Sends a single HTTP exchange
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return once response headers arrive
    async fn send(&self, request: HttpRequest, token: &CancellationToken) -> Result<HttpResponse>;
}

/// Builds the transport for a source
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport configured by `config`
    async fn create(&self, config: &HttpSourceConfig) -> Result<Arc<dyn Transport>>;
}

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring crypto provider for rustls once per process
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Another component may have installed one already
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// [`Transport`] backed by a `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a client from source configuration.
    ///
    /// Redirects are left to the redirect interceptor unless
    /// `allow_auto_redirect` is set.
    pub fn with_config(config: &HttpSourceConfig) -> Result<Self> {
        ensure_crypto_provider();

        let redirect = if config.manual_redirects() {
            reqwest::redirect::Policy::none()
        } else {
            reqwest::redirect::Policy::limited(config.max_redirects)
        };

        let mut builder = ClientBuilder::new()
            // Connection pooling
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(16)
            // Headers timeout is enforced per attempt by the retry executor
            .connect_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(redirect)
            .user_agent(config.user_agent.clone());

        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| ProtocolError::ClientSetup(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ProtocolError::ClientSetup(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Underlying client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest, token: &CancellationToken) -> Result<HttpResponse> {
        let url = request.url.clone();
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ProtocolError::Cancelled),
            response = builder.send() => response.map_err(|e| {
                if is_proxy_auth_error(&e) {
                    debug!("Proxy rejected tunnel for {url}: {e}");
                    ProtocolError::ProxyAuthenticationRequired { url: url.clone() }
                } else {
                    ProtocolError::Http(e)
                }
            })?,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(HttpResponse::new(status, headers, url, body))
    }
}

/// Proxies that answer a CONNECT with 407 surface as connect errors
fn is_proxy_auth_error(err: &reqwest::Error) -> bool {
    if err.status() == Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED) {
        return true;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(cause) = source {
        if mentions_proxy_auth(&cause.to_string()) {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Matches the tunnel error wording only; a bare "407" may be part of a URL
fn mentions_proxy_auth(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("proxy authorization required") || message.contains("proxy authentication required")
}

/// Factory producing a [`ReqwestTransport`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestTransportFactory;

#[async_trait]
impl TransportFactory for ReqwestTransportFactory {
    async fn create(&self, config: &HttpSourceConfig) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(ReqwestTransport::with_config(config)?))
    }
}
