//! In-process doubles for pipeline tests

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::credentials::{CredentialError, CredentialRequestType, CredentialService, NetworkCredential};
use crate::error::Result;
use crate::message::{HttpRequest, HttpResponse};
use crate::transport::Transport;

pub(crate) fn url(path: &str) -> Url {
    Url::parse("https://feeds.example.org").unwrap().join(path).unwrap()
}

pub(crate) fn response(status: StatusCode, url: Url, headers: &[(&str, &str)]) -> HttpResponse {
    let mut response = HttpResponse::empty(status, url);
    for (name, value) in headers {
        response.headers_mut().append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    response
}

type Responder = Box<dyn Fn(&HttpRequest, usize) -> Result<HttpResponse> + Send + Sync>;

/// Transport answering from a closure, recording every request
pub(crate) struct MockTransport {
    calls: AtomicUsize,
    seen: Mutex<Vec<HttpRequest>>,
    respond: Responder,
}

impl MockTransport {
    pub(crate) fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest, usize) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    pub(crate) fn always(status: StatusCode) -> Arc<Self> {
        Self::new(move |request, _| Ok(HttpResponse::empty(status, request.url.clone())))
    }

    /// Answers with `statuses` in order, repeating the last one
    pub(crate) fn sequence(statuses: Vec<StatusCode>) -> Arc<Self> {
        Self::new(move |request, n| {
            let status = statuses[n.min(statuses.len() - 1)];
            Ok(HttpResponse::empty(status, request.url.clone()))
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest, _token: &CancellationToken) -> Result<HttpResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());
        // Let concurrent callers interleave
        tokio::task::yield_now().await;
        (self.respond)(&request, n)
    }
}

type Answer = Box<dyn Fn(usize) -> std::result::Result<Option<NetworkCredential>, CredentialError> + Send + Sync>;

/// Credential service answering from a closure
pub(crate) struct MockCredentialService {
    prompts: AtomicUsize,
    answer: Answer,
    delay: Duration,
    last_known_good: Option<NetworkCredential>,
    pub(crate) request_types: Mutex<Vec<CredentialRequestType>>,
    pub(crate) proxies: Mutex<Vec<Option<Url>>>,
    pub(crate) used: Mutex<Vec<NetworkCredential>>,
}

impl MockCredentialService {
    pub(crate) fn new<F>(answer: F) -> Self
    where
        F: Fn(usize) -> std::result::Result<Option<NetworkCredential>, CredentialError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            prompts: AtomicUsize::new(0),
            answer: Box::new(answer),
            delay: Duration::ZERO,
            last_known_good: None,
            request_types: Mutex::new(Vec::new()),
            proxies: Mutex::new(Vec::new()),
            used: Mutex::new(Vec::new()),
        }
    }

    /// Hands out `user`/`pass-<n>` on every prompt
    pub(crate) fn granting() -> Self {
        Self::new(|n| Ok(Some(NetworkCredential::new("user", format!("pass-{n}")))))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_last_known_good(mut self, credential: NetworkCredential) -> Self {
        self.last_known_good = Some(credential);
        self
    }

    pub(crate) fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialService for MockCredentialService {
    async fn get_credentials(
        &self,
        _uri: &Url,
        proxy: Option<&Url>,
        request_type: CredentialRequestType,
        _message: &str,
        _token: &CancellationToken,
    ) -> std::result::Result<Option<NetworkCredential>, CredentialError> {
        let n = self.prompts.fetch_add(1, Ordering::SeqCst);
        self.request_types.lock().push(request_type);
        self.proxies.lock().push(proxy.cloned());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.answer)(n)
    }

    fn try_get_last_known_good(&self, _uri: &Url, _is_proxy: bool) -> Option<NetworkCredential> {
        self.last_known_good.clone()
    }

    fn credentials_successfully_used(&self, _uri: &Url, credentials: &NetworkCredential) {
        self.used.lock().push(credentials.clone());
    }
}
