//! Retry executor for HTTP exchanges.
//!
//! One logical request runs for at most `max_tries` attempts with a fixed
//! delay between them. Each attempt builds a fresh request from the factory.
//! A request timeout fails the attempt and is retried. Caller cancellation
//! never is.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::{EnvReader, parse_var};
use crate::diagnostics::{DiagnosticEvent, Diagnostics, RequestEvent};
use crate::error::{ProtocolError, Result};
use crate::message::{BodyStream, HttpRequest, HttpResponse};
use crate::transport::Transport;

/// Retry settings.
///
/// This is the only place retry tunables live; the `FEEDWIRE_HTTP_RETRY_*`
/// variables map onto it through [`RetryPolicy::from_env`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per logical request, at least 1
    pub max_tries: u32,

    /// Delay before every attempt after the first
    pub retry_delay: Duration,

    /// Also retry `429 Too Many Requests`
    pub retry_429: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 3,
            retry_delay: Duration::from_millis(200),
            retry_429: false,
        }
    }
}

impl RetryPolicy {
    /// Create retry policy from environment variables
    pub fn from_env(env: &dyn EnvReader) -> Self {
        let defaults = Self::default();
        let enabled = parse_var::<bool>(env, "FEEDWIRE_HTTP_RETRY_ENABLED").unwrap_or(true);

        let max_tries = if enabled {
            parse_var::<u32>(env, "FEEDWIRE_HTTP_MAX_TRIES")
                .filter(|n| *n >= 1)
                .unwrap_or(defaults.max_tries)
        } else {
            1
        };

        Self {
            max_tries,
            retry_delay: parse_var::<u64>(env, "FEEDWIRE_HTTP_RETRY_DELAY_MS")
                .map_or(defaults.retry_delay, Duration::from_millis),
            retry_429: parse_var::<bool>(env, "FEEDWIRE_HTTP_RETRY_429").unwrap_or(defaults.retry_429),
        }
    }

    /// Whether a response with `status` counts as a failed attempt
    pub fn retries_status(&self, status: StatusCode) -> bool {
        status.is_server_error() || (self.retry_429 && status == StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Builds a fresh request for every attempt
pub type RequestFactory = Arc<dyn Fn() -> Result<HttpRequest> + Send + Sync>;

/// One logical request for the [`RetryExecutor`]
#[derive(Clone)]
pub struct RetryRequest {
    /// Handler the attempts go through
    pub client: Arc<dyn Transport>,
    /// Called once per attempt
    pub request_factory: RequestFactory,
    /// Attempt ceiling, at least 1
    pub max_tries: u32,
    /// Time allowed for response headers
    pub request_timeout: Duration,
    /// Longest allowed gap between body chunks
    pub download_timeout: Duration,
    /// Delay before every attempt after the first
    pub retry_delay: Duration,
    /// Headers merged into every attempt
    pub extra_headers: HeaderMap,
    /// This logical request is itself a retry by the caller
    pub is_retry: bool,
    /// The caller will not retry this logical request again
    pub is_last_attempt: bool,
}

impl fmt::Debug for RetryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRequest")
            .field("max_tries", &self.max_tries)
            .field("request_timeout", &self.request_timeout)
            .field("download_timeout", &self.download_timeout)
            .field("retry_delay", &self.retry_delay)
            .field("extra_headers", &self.extra_headers)
            .field("is_retry", &self.is_retry)
            .field("is_last_attempt", &self.is_last_attempt)
            .finish_non_exhaustive()
    }
}

impl RetryRequest {
    /// Create a request with default timeouts and retry settings
    pub fn new<F>(client: Arc<dyn Transport>, request_factory: F) -> Self
    where
        F: Fn() -> Result<HttpRequest> + Send + Sync + 'static,
    {
        let policy = RetryPolicy::default();
        Self {
            client,
            request_factory: Arc::new(request_factory),
            max_tries: policy.max_tries,
            request_timeout: Duration::from_secs(100),
            download_timeout: Duration::from_secs(60),
            retry_delay: policy.retry_delay,
            extra_headers: HeaderMap::new(),
            is_retry: false,
            is_last_attempt: false,
        }
    }
}

/// Runs [`RetryRequest`]s
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    diagnostics: Diagnostics,
}

impl RetryExecutor {
    /// Create an executor; `policy` decides which statuses are retried
    pub fn new(policy: RetryPolicy, diagnostics: Diagnostics) -> Self {
        Self {
            policy,
            diagnostics,
        }
    }

    /// Send `request`, retrying failed attempts.
    ///
    /// Returns the last response even when its status still counts as a
    /// failure; the caller inspects the status. Returns the last error when
    /// every attempt failed without a response.
    pub async fn send(
        &self,
        request: RetryRequest,
        source: &str,
        token: &CancellationToken,
    ) -> Result<HttpResponse> {
        let max_tries = request.max_tries.max(1);
        let mut tries = 0;

        loop {
            tries += 1;
            if tries > 1 {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(ProtocolError::Cancelled),
                    () = tokio::time::sleep(request.retry_delay) => {}
                }
            }

            let mut attempt = (request.request_factory)()?;
            for (name, value) in &request.extra_headers {
                attempt.headers.insert(name.clone(), value.clone());
            }

            let url = attempt.url.clone();
            let is_last_attempt = tries >= max_tries;
            info!("  {} {}", attempt.method, url);

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => Err(ProtocolError::Cancelled),
                sent = tokio::time::timeout(request.request_timeout, request.client.send(attempt, token)) => {
                    sent.unwrap_or_else(|_| Err(ProtocolError::Timeout {
                        url: url.clone(),
                        timeout: request.request_timeout,
                    }))
                }
            };
            let header_duration = started.elapsed();

            let mut event = RequestEvent {
                timestamp: SystemTime::now(),
                source: source.to_string(),
                url: url.clone(),
                header_duration: None,
                status: None,
                is_success: false,
                is_retry: request.is_retry || tries > 1,
                is_cancelled: false,
                is_last_attempt: is_last_attempt && request.is_last_attempt,
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    info!("  {} {} {}ms", status.as_u16(), url, header_duration.as_millis());

                    let failed = self.policy.retries_status(status);
                    event.header_duration = Some(header_duration);
                    event.status = Some(status);
                    event.is_success = !failed;
                    self.diagnostics.emit(DiagnosticEvent::Request(event));

                    if failed && !is_last_attempt {
                        warn!(
                            "An error was encountered when fetching '{url}' ({}). The request will now be retried.",
                            status.as_u16()
                        );
                        drop(response);
                        continue;
                    }

                    let diagnostics = self.diagnostics.clone();
                    let source = source.to_string();
                    let download_timeout = request.download_timeout;
                    return Ok(response.map_body(|body| {
                        DownloadTimeoutStream::new(body, url.clone(), download_timeout)
                            .on_complete(move |bytes, duration| {
                                diagnostics.emit(DiagnosticEvent::DownloadCompleted {
                                    source,
                                    url,
                                    bytes,
                                    duration,
                                });
                            })
                            .boxed()
                    }));
                }
                Err(e) if e.is_cancelled() => {
                    event.is_cancelled = true;
                    self.diagnostics.emit(DiagnosticEvent::Request(event));
                    return Err(e);
                }
                Err(e) => {
                    self.diagnostics.emit(DiagnosticEvent::Request(event));
                    if is_last_attempt || !e.should_retry() {
                        return Err(e);
                    }
                    warn!("An error was encountered when fetching '{url}'. The request will now be retried. {e}");
                }
            }
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(u64, Duration) + Send>;

/// Fails a body stream that produces no bytes for longer than a timeout
pub struct DownloadTimeoutStream {
    inner: BodyStream,
    url: Url,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    started: Option<Instant>,
    bytes: u64,
    on_complete: Option<CompletionCallback>,
    done: bool,
}

impl fmt::Debug for DownloadTimeoutStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTimeoutStream")
            .field("url", &self.url.as_str())
            .field("timeout", &self.timeout)
            .field("bytes", &self.bytes)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl DownloadTimeoutStream {
    /// Wrap `inner`; the clock starts at the first poll
    pub fn new(inner: BodyStream, url: Url, timeout: Duration) -> Self {
        Self {
            inner,
            url,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            started: None,
            bytes: 0,
            on_complete: None,
            done: false,
        }
    }

    /// Call `callback` with the byte count and duration when the stream ends
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(u64, Duration) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    fn stalled(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "The download of '{}' timed out because no data was received for {}ms.",
                self.url,
                self.timeout.as_millis()
            ),
        )
    }
}

impl Stream for DownloadTimeoutStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.started.is_none() {
            let now = Instant::now();
            this.started = Some(now);
            this.deadline.as_mut().reset(now + this.timeout);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                this.deadline.as_mut().reset(Instant::now() + this.timeout);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                if let Some(callback) = this.on_complete.take() {
                    let elapsed = this.started.map(|s| s.elapsed()).unwrap_or_default();
                    callback(this.bytes, elapsed);
                }
                Poll::Ready(None)
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.done = true;
                    Poll::Ready(Some(Err(this.stalled())))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
