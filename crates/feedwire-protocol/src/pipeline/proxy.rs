//! Proxy credential negotiation

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderValue, PROXY_AUTHORIZATION};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::Url;
use uuid::Uuid;

use super::{Interceptor, Next};
use crate::credentials::{
    AuthAttemptState, AuthStateRegistry, CredentialContext, CredentialError, CredentialRequestType,
};
use crate::error::{ProtocolError, Result};
use crate::message::{HttpRequest, HttpResponse};

/// Proxy prompts allowed per correlation id
pub const MAX_PROXY_AUTH_ATTEMPTS: u32 = 3;

/// Sends cached proxy credentials and prompts for new ones when the proxy
/// answers 407
pub struct ProxyAuthInterceptor {
    proxy: Url,
    context: CredentialContext,
    states: AuthStateRegistry,
}

impl ProxyAuthInterceptor {
    /// Negotiate credentials for `proxy`
    pub fn new(proxy: Url, context: CredentialContext) -> Self {
        Self {
            proxy,
            context,
            states: AuthStateRegistry::new(),
        }
    }

    /// Proxy prompt bookkeeping for `correlation_id`
    pub fn attempt_state(&self, correlation_id: Uuid) -> AuthAttemptState {
        self.states.get(correlation_id)
    }

    fn apply(&self, request: &mut HttpRequest) -> Result<()> {
        if let Some(credentials) = self.context.proxy_cache().get(&self.proxy) {
            let value = HeaderValue::from_str(&credentials.basic_auth_header())
                .map_err(|e| ProtocolError::InvalidHeader(format!("Proxy-Authorization: {e}")))?;
            request.headers.insert(PROXY_AUTHORIZATION, value);
        }
        Ok(())
    }

    /// Returns whether the request should be sent again
    async fn acquire(
        &self,
        target: &Url,
        version: u64,
        correlation_id: Uuid,
        token: &CancellationToken,
    ) -> Result<bool> {
        let cache = self.context.proxy_cache();
        if cache.version() != version {
            return Ok(true);
        }
        let Some(service) = self.context.service() else {
            return Ok(false);
        };

        let _prompt = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ProtocolError::Cancelled),
            guard = self.context.prompt_lock().lock() => guard,
        };

        if cache.version() != version {
            debug!("Proxy credentials for {} changed while waiting", self.proxy);
            return Ok(true);
        }

        if self.states.get(correlation_id).is_blocked {
            debug!("Proxy prompts for {} are exhausted for this operation", self.proxy);
            return Ok(false);
        }
        self.states.update(correlation_id, |state| {
            state.increment_capped(MAX_PROXY_AUTH_ATTEMPTS);
        });

        let current = cache.get(&self.proxy);
        if let Some(known) = service.try_get_last_known_good(&self.proxy, true)
            && current.as_ref() != Some(&known)
        {
            cache.update(&self.proxy, known);
            return Ok(true);
        }

        let message = format!(
            "The remote server returned an error: (407) Proxy Authentication Required. Please provide proxy credentials for: {}",
            self.proxy
        );
        match service
            .get_credentials(target, Some(&self.proxy), CredentialRequestType::Proxy, &message, token)
            .await
        {
            Ok(Some(credentials)) => {
                cache.update(&self.proxy, credentials);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(CredentialError::Cancelled) if token.is_cancelled() => Err(ProtocolError::Cancelled),
            Err(CredentialError::Cancelled) => Ok(false),
            Err(CredentialError::Failed(reason)) => {
                error!("Failed to obtain proxy credentials for {}: {reason}", self.proxy);
                self.states.update(correlation_id, AuthAttemptState::block);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Interceptor for ProxyAuthInterceptor {
    async fn intercept(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse> {
        loop {
            let version = self.context.proxy_cache().version();
            let mut attempt = request.clone();
            self.apply(&mut attempt)?;

            let outcome = next.run(attempt).await;
            let rejected = match &outcome {
                Ok(response) => response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                Err(ProtocolError::ProxyAuthenticationRequired { .. }) => true,
                Err(_) => false,
            };
            if !rejected {
                return outcome;
            }

            let acquired = self
                .acquire(&request.url, version, request.correlation_id(), next.token())
                .await?;
            if !acquired {
                return outcome;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::credentials::NetworkCredential;
    use crate::message::RequestOptions;
    use crate::pipeline::HandlerPipeline;
    use crate::pipeline::testing::{MockCredentialService, MockTransport, url};
    use crate::transport::Transport;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn proxy() -> Url {
        Url::parse("http://proxy.local:3128").unwrap()
    }

    fn behind_proxy(
        transport: Arc<MockTransport>,
        service: Arc<MockCredentialService>,
    ) -> (HandlerPipeline, CredentialContext) {
        let context = CredentialContext::new().with_service(service);
        let pipeline = HandlerPipeline::new(transport)
            .wrap(Arc::new(ProxyAuthInterceptor::new(proxy(), context.clone())));
        (pipeline, context)
    }

    fn request(correlation_id: Uuid) -> HttpRequest {
        HttpRequest::get(url("/v3/index.json")).with_options(RequestOptions {
            prompt_on_403: false,
            correlation_id: Some(correlation_id),
        })
    }

    #[tokio::test]
    async fn test_prompts_on_407_and_sends_proxy_authorization() {
        let transport = MockTransport::new(|request, _| {
            let status = if request.headers.contains_key(PROXY_AUTHORIZATION) {
                StatusCode::OK
            } else {
                StatusCode::PROXY_AUTHENTICATION_REQUIRED
            };
            Ok(HttpResponse::empty(status, request.url.clone()))
        });
        let service = Arc::new(MockCredentialService::granting());
        let (pipeline, context) = behind_proxy(transport.clone(), service.clone());

        let response = pipeline
            .send(HttpRequest::get(url("/v3/index.json")), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*service.request_types.lock(), vec![CredentialRequestType::Proxy]);
        assert_eq!(*service.proxies.lock(), vec![Some(proxy())]);
        assert!(context.proxy_cache().get(&proxy()).is_some());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_prompts_are_capped_at_three() {
        let transport = MockTransport::always(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        let service = Arc::new(MockCredentialService::granting());
        let (pipeline, _) = behind_proxy(transport.clone(), service.clone());

        let response = pipeline
            .send(HttpRequest::get(url("/v3/index.json")), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(service.prompts(), MAX_PROXY_AUTH_ATTEMPTS as usize);
        assert_eq!(transport.calls(), MAX_PROXY_AUTH_ATTEMPTS as usize + 1);
    }

    #[tokio::test]
    async fn test_proxy_auth_error_is_handled_like_407() {
        let transport = MockTransport::new(|request, _| {
            if request.headers.contains_key(PROXY_AUTHORIZATION) {
                Ok(HttpResponse::empty(StatusCode::OK, request.url.clone()))
            } else {
                Err(ProtocolError::ProxyAuthenticationRequired {
                    url: request.url.clone(),
                })
            }
        });
        let service = Arc::new(MockCredentialService::granting());
        let (pipeline, _) = behind_proxy(transport, service.clone());

        let response = pipeline
            .send(HttpRequest::get(url("/v3/index.json")), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(service.prompts(), 1);
    }

    #[tokio::test]
    async fn test_declined_prompt_returns_original_error() {
        let transport = MockTransport::new(|request, _| {
            Err(ProtocolError::ProxyAuthenticationRequired {
                url: request.url.clone(),
            })
        });
        let service = Arc::new(MockCredentialService::new(|_| Ok(None)));
        let (pipeline, _) = behind_proxy(transport.clone(), service);

        let result = pipeline
            .send(HttpRequest::get(url("/v3/index.json")), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ProtocolError::ProxyAuthenticationRequired { .. })));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_updated_cache_is_reused_without_prompt() {
        let transport = MockTransport::new(|request, _| {
            let status = if request.headers.contains_key(PROXY_AUTHORIZATION) {
                StatusCode::OK
            } else {
                StatusCode::PROXY_AUTHENTICATION_REQUIRED
            };
            Ok(HttpResponse::empty(status, request.url.clone()))
        });
        let service = Arc::new(MockCredentialService::granting());
        let (pipeline, context) = behind_proxy(transport, service.clone());
        context
            .proxy_cache()
            .update(&proxy(), NetworkCredential::new("proxy-user", "secret"));

        let response = pipeline
            .send(HttpRequest::get(url("/v3/index.json")), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(service.prompts(), 0);
    }

    #[tokio::test]
    async fn test_prompt_cap_is_scoped_per_operation() {
        let transport = MockTransport::always(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        let service = Arc::new(MockCredentialService::granting());
        let context = CredentialContext::new().with_service(service.clone());
        let interceptor = Arc::new(ProxyAuthInterceptor::new(proxy(), context));
        let pipeline = HandlerPipeline::new(transport).wrap(interceptor.clone());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        pipeline.send(request(first), &CancellationToken::new()).await.unwrap();
        pipeline.send(request(first), &CancellationToken::new()).await.unwrap();
        assert_eq!(service.prompts(), MAX_PROXY_AUTH_ATTEMPTS as usize);
        assert!(interceptor.attempt_state(first).is_blocked);

        pipeline.send(request(second), &CancellationToken::new()).await.unwrap();
        assert_eq!(service.prompts(), 2 * MAX_PROXY_AUTH_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_failing_service_blocks_operation() {
        let transport = MockTransport::always(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        let service = Arc::new(MockCredentialService::new(|_| {
            Err(CredentialError::Failed("keychain locked".to_string()))
        }));
        let context = CredentialContext::new().with_service(service.clone());
        let interceptor = Arc::new(ProxyAuthInterceptor::new(proxy(), context));
        let pipeline = HandlerPipeline::new(transport.clone()).wrap(interceptor.clone());
        let operation = Uuid::new_v4();

        let response = pipeline
            .send(request(operation), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert!(interceptor.attempt_state(operation).is_blocked);

        pipeline.send(request(operation), &CancellationToken::new()).await.unwrap();
        assert_eq!(service.prompts(), 1);
        assert_eq!(transport.calls(), 2);
    }
}
