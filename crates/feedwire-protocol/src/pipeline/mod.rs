//! Interceptor pipeline wrapped around the transport.
//!
//! Each [`Interceptor`] receives the request and a [`Next`] handle for the
//! layers below it. It may call `next.run` more than once, resending a
//! modified clone, before returning a response to the layer above.
//!
//! ```text
//! RetryExecutor
//!   -> redirect        (manual redirects only)
//!   -> credential      (401, 403 when opted in)
//!   -> federated       (flag and token exchange)
//!   -> proxy           (proxy configured)
//!   -> warning
//!   -> Transport
//! ```

mod credential;
mod federated;
mod proxy;
mod redirect;
mod warning;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use credential::CredentialInterceptor;
pub use federated::{FederatedAuthInterceptor, STS_ENDPOINT_HEADER, STS_REALM_HEADER, STS_TOKEN_HEADER};
pub use proxy::{MAX_PROXY_AUTH_ATTEMPTS, ProxyAuthInterceptor};
pub use redirect::RedirectInterceptor;
pub use warning::{WARNING_HEADER, WarningInterceptor};

use crate::config::{HttpSourceConfig, PackageSource};
use crate::credentials::{CredentialContext, SourceCredentials};
use crate::error::Result;
use crate::message::{HttpRequest, HttpResponse};
use crate::transport::Transport;

/// One layer of the pipeline
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Handle `request`, delegating to `next` for the layers below
    async fn intercept(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse>;
}

/// The layers below the current interceptor
#[derive(Clone, Copy)]
pub struct Next<'a> {
    transport: &'a dyn Transport,
    interceptors: &'a [Arc<dyn Interceptor>],
    token: &'a CancellationToken,
}

impl<'a> Next<'a> {
    /// Cancellation token of the current exchange
    pub fn token(&self) -> &'a CancellationToken {
        self.token
    }

    /// Send `request` through the remaining layers
    pub fn run(self, request: HttpRequest) -> BoxFuture<'a, Result<HttpResponse>> {
        match self.interceptors.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    interceptors: rest,
                    ..self
                };
                head.intercept(request, next)
            }
            None => self.transport.send(request, self.token),
        }
    }
}

/// A transport wrapped in an ordered list of interceptors
pub struct HandlerPipeline {
    transport: Arc<dyn Transport>,
    // Outermost first
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl fmt::Debug for HandlerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerPipeline")
            .field("layers", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl HandlerPipeline {
    /// Pipeline with no interceptors
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptors: Vec::new(),
        }
    }

    /// Add `interceptor` as the new outermost layer
    #[must_use]
    pub fn wrap(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.insert(0, interceptor);
        self
    }

    /// Compose the standard layers for `source`.
    ///
    /// Warning logging sits next to the transport. Proxy auth is added when a
    /// proxy is configured, federated auth when enabled and a token exchange
    /// is available, credential prompting always, and redirects outermost
    /// when the transport does not follow them itself.
    pub fn for_source(
        transport: Arc<dyn Transport>,
        source: &PackageSource,
        config: &HttpSourceConfig,
        context: &CredentialContext,
        credentials: Arc<SourceCredentials>,
    ) -> Self {
        let mut pipeline = Self::new(transport).wrap(Arc::new(WarningInterceptor));

        if let Some(proxy) = &config.proxy {
            pipeline = pipeline.wrap(Arc::new(ProxyAuthInterceptor::new(
                proxy.clone(),
                context.clone(),
            )));
        }

        if config.enable_federated_auth && context.token_exchange().is_some() {
            pipeline = pipeline.wrap(Arc::new(FederatedAuthInterceptor::new(context.clone())));
        }

        pipeline = pipeline.wrap(Arc::new(CredentialInterceptor::new(
            source.url.clone(),
            credentials,
            context.clone(),
        )));

        if config.manual_redirects() {
            pipeline = pipeline.wrap(Arc::new(RedirectInterceptor::new(config.max_redirects)));
        }

        pipeline
    }

    /// Number of interceptors
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether requests go straight to the transport
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

#[async_trait]
impl Transport for HandlerPipeline {
    async fn send(&self, request: HttpRequest, token: &CancellationToken) -> Result<HttpResponse> {
        Next {
            transport: self.transport.as_ref(),
            interceptors: &self.interceptors,
            token,
        }
        .run(request)
        .await
    }
}

/// Whether `a` and `b` share scheme, host and port
pub(crate) fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}
