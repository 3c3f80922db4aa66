//! Federated token authentication.
//!
//! A server that accepts federated tokens answers 401 with an endpoint and
//! realm. The token obtained from the endpoint is sent base64 encoded on
//! later requests to the same URI or its root.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::header::HeaderValue;
use tracing::{debug, warn};
use url::Url;

use super::{Interceptor, Next};
use crate::credentials::{CredentialContext, CredentialError};
use crate::error::{ProtocolError, Result};
use crate::message::{HttpRequest, HttpResponse};

/// Token endpoint advertised by the server
pub const STS_ENDPOINT_HEADER: &str = "X-NuGet-STS-EndPoint";
/// Realm advertised by the server
pub const STS_REALM_HEADER: &str = "X-NuGet-STS-Realm";
/// Header carrying the token
pub const STS_TOKEN_HEADER: &str = "X-NuGet-STS-Token";

/// Exchanges server-advertised endpoints for tokens and attaches them
pub struct FederatedAuthInterceptor {
    context: CredentialContext,
}

impl FederatedAuthInterceptor {
    /// Use the token store and exchange in `context`
    pub fn new(context: CredentialContext) -> Self {
        Self { context }
    }

    fn apply(&self, request: &mut HttpRequest) -> Result<()> {
        if let Some(token) = self.context.token_store().get(&request.url) {
            let value = HeaderValue::from_str(&STANDARD.encode(token))
                .map_err(|e| ProtocolError::InvalidHeader(format!("{STS_TOKEN_HEADER}: {e}")))?;
            request.headers.insert(STS_TOKEN_HEADER, value);
        }
        Ok(())
    }

    /// Returns whether a new token is available
    async fn acquire(
        &self,
        challenge: Option<(String, String)>,
        target: &Url,
        version: u64,
        next: &Next<'_>,
    ) -> Result<bool> {
        let store = self.context.token_store();
        if store.version() != version {
            return Ok(true);
        }
        let Some(exchange) = self.context.token_exchange() else {
            return Ok(false);
        };
        let Some((endpoint, realm)) = challenge else {
            return Ok(false);
        };
        let Ok(endpoint) = Url::parse(&endpoint) else {
            warn!("Ignoring invalid token endpoint '{endpoint}' from {target}");
            return Ok(false);
        };

        debug!("Requesting federated token from {endpoint} for realm {realm}");
        match exchange.request_token(&endpoint, &realm, next.token()).await {
            Ok(Some(token)) => {
                store.add(target, token);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(CredentialError::Cancelled) if next.token().is_cancelled() => Err(ProtocolError::Cancelled),
            Err(e) => {
                warn!("Federated token request to {endpoint} failed: {e}");
                Ok(false)
            }
        }
    }
}

/// Endpoint and realm advertised by a 401
fn challenge(response: &HttpResponse) -> Option<(String, String)> {
    let endpoint = response.header_str(STS_ENDPOINT_HEADER)?;
    let realm = response.header_str(STS_REALM_HEADER)?;
    Some((endpoint.to_string(), realm.to_string()))
}

#[async_trait]
impl Interceptor for FederatedAuthInterceptor {
    async fn intercept(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse> {
        let version = self.context.token_store().version();
        let mut attempt = request.clone();
        self.apply(&mut attempt)?;

        let response = next.run(attempt).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let target = response.url().clone();
        if !self.acquire(challenge(&response), &target, version, &next).await? {
            return Ok(response);
        }
        drop(response);

        let mut retry = request;
        self.apply(&mut retry)?;
        next.run(retry).await
    }
}
