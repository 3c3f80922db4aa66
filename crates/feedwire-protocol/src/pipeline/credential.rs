//! Feed credential negotiation for 401 and opted-in 403 responses

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::Url;
use uuid::Uuid;

use super::{Interceptor, Next, same_origin};
use crate::credentials::{
    AuthAttemptState, AuthStateRegistry, CredentialContext, CredentialError, CredentialRequestType,
    CredentialService, NetworkCredential, SourceCredentials,
};
use crate::error::{ProtocolError, Result};
use crate::message::{HttpRequest, HttpResponse};

enum Acquired {
    /// Someone else replaced the credentials while we waited
    Changed,
    /// New credentials from the service
    Obtained(NetworkCredential),
    /// Give up and return the failing response
    Unavailable,
}

/// Attaches source credentials and prompts for new ones on 401, or on 403
/// when the request opts in.
///
/// Prompts are counted per correlation id and stop after
/// [`MAX_AUTH_ATTEMPTS`](crate::credentials::MAX_AUTH_ATTEMPTS).
pub struct CredentialInterceptor {
    source_url: Url,
    credentials: Arc<SourceCredentials>,
    context: CredentialContext,
    states: AuthStateRegistry,
    acquire_lock: Mutex<()>,
}

impl CredentialInterceptor {
    /// Guard requests to `source_url` with `credentials`
    pub fn new(source_url: Url, credentials: Arc<SourceCredentials>, context: CredentialContext) -> Self {
        Self {
            source_url,
            credentials,
            context,
            states: AuthStateRegistry::new(),
            acquire_lock: Mutex::new(()),
        }
    }

    /// Prompt bookkeeping for `correlation_id`
    pub fn attempt_state(&self, correlation_id: Uuid) -> AuthAttemptState {
        self.states.get(correlation_id)
    }

    fn apply(&self, request: &mut HttpRequest) -> Result<()> {
        if !same_origin(&request.url, &self.source_url) {
            return Ok(());
        }
        if let Some(credentials) = self.credentials.get() {
            let value = HeaderValue::from_str(&credentials.basic_auth_header())
                .map_err(|e| ProtocolError::InvalidHeader(format!("Authorization: {e}")))?;
            request.headers.insert(AUTHORIZATION, value);
        }
        Ok(())
    }

    async fn acquire(
        &self,
        service: &dyn CredentialService,
        request_type: CredentialRequestType,
        version: u64,
        correlation_id: Uuid,
        token: &CancellationToken,
    ) -> Result<Acquired> {
        let _acquire = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ProtocolError::Cancelled),
            guard = self.acquire_lock.lock() => guard,
        };
        let _prompt = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ProtocolError::Cancelled),
            guard = self.context.prompt_lock().lock() => guard,
        };

        if self.credentials.version() != version {
            debug!("Credentials for {} changed while waiting, reusing them", self.source_url);
            return Ok(Acquired::Changed);
        }

        if self.states.get(correlation_id).is_blocked {
            debug!("Credential prompts for {} are blocked for this operation", self.source_url);
            return Ok(Acquired::Unavailable);
        }

        let current = self.credentials.get();
        if let Some(known) = service.try_get_last_known_good(&self.source_url, false)
            && current.as_ref() != Some(&known)
        {
            self.states.update(correlation_id, AuthAttemptState::increment);
            self.credentials.set(Some(known.clone()));
            return Ok(Acquired::Obtained(known));
        }

        let message = match request_type {
            CredentialRequestType::Forbidden => format!(
                "The remote server returned an error: (403) Forbidden. Please provide credentials for: {}",
                self.source_url
            ),
            _ => format!(
                "The remote server returned an error: (401) Unauthorized. Please provide credentials for: {}",
                self.source_url
            ),
        };

        match service
            .get_credentials(&self.source_url, None, request_type, &message, token)
            .await
        {
            Ok(Some(credentials)) => {
                self.states.update(correlation_id, AuthAttemptState::increment);
                self.credentials.set(Some(credentials.clone()));
                Ok(Acquired::Obtained(credentials))
            }
            Ok(None) => {
                self.states.update(correlation_id, AuthAttemptState::increment);
                Ok(Acquired::Unavailable)
            }
            Err(CredentialError::Cancelled) if token.is_cancelled() => Err(ProtocolError::Cancelled),
            Err(CredentialError::Cancelled) => {
                self.states.update(correlation_id, AuthAttemptState::increment);
                Ok(Acquired::Unavailable)
            }
            Err(CredentialError::Failed(reason)) => {
                error!("Failed to obtain credentials for {}: {reason}", self.source_url);
                self.states.update(correlation_id, AuthAttemptState::block);
                Ok(Acquired::Unavailable)
            }
        }
    }
}

#[async_trait]
impl Interceptor for CredentialInterceptor {
    async fn intercept(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse> {
        let correlation_id = request.correlation_id();
        let mut prompted: Option<NetworkCredential> = None;

        loop {
            let version = self.credentials.version();
            let mut attempt = request.clone();
            self.apply(&mut attempt)?;

            let response = next.run(attempt).await?;
            let request_type = match response.status() {
                StatusCode::UNAUTHORIZED => CredentialRequestType::Unauthorized,
                StatusCode::FORBIDDEN if request.options.prompt_on_403 => CredentialRequestType::Forbidden,
                _ => {
                    if let (Some(credentials), Some(service)) = (&prompted, self.context.service()) {
                        service.credentials_successfully_used(&self.source_url, credentials);
                    }
                    return Ok(response);
                }
            };

            let Some(service) = self.context.service() else {
                return Ok(response);
            };

            match self
                .acquire(service.as_ref(), request_type, version, correlation_id, next.token())
                .await?
            {
                Acquired::Changed => {}
                Acquired::Obtained(credentials) => prompted = Some(credentials),
                Acquired::Unavailable => return Ok(response),
            }
        }
    }
}
