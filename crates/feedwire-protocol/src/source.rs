//! HTTP access to one package source.
//!
//! [`HttpSource::get`] serves cached GETs: a fresh cache entry is returned
//! without touching the network, otherwise the response is fetched through
//! the throttle, the retry executor and the interceptor pipeline, committed
//! to the disk cache and handed to the caller while the entry is still
//! locked.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use feedwire_cache::{CacheContext, CacheError, CacheObserver, CachedFile, ContentValidator, DiskCache};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{HttpSourceConfig, PackageSource};
use crate::credentials::{CredentialContext, SourceCredentials};
use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::error::{ProtocolError, Result};
use crate::message::{HttpRequest, HttpResponse, SESSION_ID_HEADER};
use crate::pipeline::HandlerPipeline;
use crate::retry::{RequestFactory, RetryExecutor, RetryRequest};
use crate::throttle::{Throttle, ThrottleSlot, ThrottledResponse, throttle_for};
use crate::transport::{ReqwestTransportFactory, TransportFactory};

/// Readable response body
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// How a cached GET was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpSourceResultStatus {
    /// Read from the cache file: a fresh hit, an entry confirmed by 304, or
    /// one committed during this call
    OpenedFromDisk,
    /// Streamed straight from the network without touching the cache
    OpenedFromNetwork,
    /// 404 with `ignore_not_found`
    NotFound,
    /// 204
    NoContent,
}

/// Outcome of [`HttpSource::get`]
pub struct HttpSourceResult {
    /// How the result was obtained
    pub status: HttpSourceResultStatus,
    /// Cache file backing `stream`, absent for direct downloads
    pub cache_file: Option<PathBuf>,
    /// Body, absent for `NotFound` and `NoContent`
    pub stream: Option<BodyReader>,
}

impl fmt::Debug for HttpSourceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSourceResult")
            .field("status", &self.status)
            .field("cache_file", &self.cache_file)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

impl HttpSourceResult {
    fn empty(status: HttpSourceResultStatus) -> Self {
        Self {
            status,
            cache_file: None,
            stream: None,
        }
    }

    fn from_file(status: HttpSourceResultStatus, file: CachedFile) -> Self {
        Self {
            status,
            cache_file: Some(file.path().to_path_buf()),
            stream: Some(Box::pin(file.into_file())),
        }
    }

    /// Read the whole body; empty when there is none
    pub async fn read_to_end(self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        if let Some(mut stream) = self.stream {
            stream.read_to_end(&mut buffer).await?;
        }
        Ok(buffer)
    }
}

/// A cached GET
#[derive(Clone)]
pub struct CachedRequest {
    /// Resource to fetch
    pub uri: Url,
    /// Names the entry within the source's cache directory
    pub cache_key: String,
    /// Max age, direct download, refresh and session id
    pub cache_context: CacheContext,
    /// `Accept` values, in order
    pub accept: Vec<String>,
    /// Deliver [`HttpSourceResultStatus::NotFound`] for 404 instead of failing
    pub ignore_not_found: bool,
    /// Attempts; the configured retry policy when unset
    pub max_tries: Option<u32>,
    /// Header timeout; the configured one when unset
    pub request_timeout: Option<Duration>,
    /// Body stall timeout; the configured one when unset
    pub download_timeout: Option<Duration>,
    /// Checks cached and downloaded content
    pub content_validator: Option<ContentValidator>,
    /// Caller is retrying this request
    pub is_retry: bool,
    /// Caller will not retry again
    pub is_last_attempt: bool,
}

impl fmt::Debug for CachedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedRequest")
            .field("uri", &self.uri.as_str())
            .field("cache_key", &self.cache_key)
            .field("cache_context", &self.cache_context)
            .field("accept", &self.accept)
            .field("ignore_not_found", &self.ignore_not_found)
            .field("max_tries", &self.max_tries)
            .field("content_validator", &self.content_validator.is_some())
            .finish_non_exhaustive()
    }
}

impl CachedRequest {
    /// Fetch `uri` into the entry named `cache_key`
    pub fn new(uri: Url, cache_key: impl Into<String>, cache_context: CacheContext) -> Self {
        Self {
            uri,
            cache_key: cache_key.into(),
            cache_context,
            accept: Vec::new(),
            ignore_not_found: false,
            max_tries: None,
            request_timeout: None,
            download_timeout: None,
            content_validator: None,
            is_retry: false,
            is_last_attempt: false,
        }
    }

    /// Add an `Accept` value
    #[must_use]
    pub fn with_accept(mut self, media_type: impl Into<String>) -> Self {
        self.accept.push(media_type.into());
        self
    }

    /// Deliver a sentinel for 404
    #[must_use]
    pub fn with_ignore_not_found(mut self, ignore: bool) -> Self {
        self.ignore_not_found = ignore;
        self
    }

    /// Override the attempt count
    #[must_use]
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    /// Validate content before it is served or committed
    #[must_use]
    pub fn with_validator(mut self, validator: ContentValidator) -> Self {
        self.content_validator = Some(validator);
        self
    }

    fn to_source_request(&self, if_modified_since: Option<SystemTime>) -> HttpSourceRequest {
        let uri = self.uri.clone();
        HttpSourceRequest {
            request_factory: Arc::new(move || {
                let mut request = HttpRequest::get(uri.clone());
                if let Some(since) = if_modified_since {
                    request.append_header("If-Modified-Since", &httpdate::fmt_http_date(since))?;
                }
                Ok(request)
            }),
            accept: self.accept.clone(),
            ignore_not_found: self.ignore_not_found,
            max_tries: self.max_tries,
            request_timeout: self.request_timeout,
            download_timeout: self.download_timeout,
            session_id: Some(self.cache_context.session_id),
            is_retry: self.is_retry,
            is_last_attempt: self.is_last_attempt,
        }
    }
}

/// An uncached request
#[derive(Clone)]
pub struct HttpSourceRequest {
    request_factory: RequestFactory,
    /// `Accept` values, in order
    pub accept: Vec<String>,
    /// Hand `None` to the callback for 404 instead of failing
    pub ignore_not_found: bool,
    /// Attempts; the configured retry policy when unset
    pub max_tries: Option<u32>,
    /// Header timeout; the configured one when unset
    pub request_timeout: Option<Duration>,
    /// Body stall timeout; the configured one when unset
    pub download_timeout: Option<Duration>,
    /// Session id sent on the wire; generated when unset
    pub session_id: Option<Uuid>,
    /// Caller is retrying this request
    pub is_retry: bool,
    /// Caller will not retry again
    pub is_last_attempt: bool,
}

impl fmt::Debug for HttpSourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSourceRequest")
            .field("accept", &self.accept)
            .field("ignore_not_found", &self.ignore_not_found)
            .field("max_tries", &self.max_tries)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl HttpSourceRequest {
    /// Build each attempt with `request_factory`
    pub fn new<F>(request_factory: F) -> Self
    where
        F: Fn() -> Result<HttpRequest> + Send + Sync + 'static,
    {
        Self {
            request_factory: Arc::new(request_factory),
            accept: Vec::new(),
            ignore_not_found: false,
            max_tries: None,
            request_timeout: None,
            download_timeout: None,
            session_id: None,
            is_retry: false,
            is_last_attempt: false,
        }
    }

    /// GET `uri`
    pub fn get(uri: Url) -> Self {
        Self::new(move || Ok(HttpRequest::get(uri.clone())))
    }

    /// Add an `Accept` value
    #[must_use]
    pub fn with_accept(mut self, media_type: impl Into<String>) -> Self {
        self.accept.push(media_type.into());
        self
    }

    /// Hand `None` to the callback for 404
    #[must_use]
    pub fn with_ignore_not_found(mut self, ignore: bool) -> Self {
        self.ignore_not_found = ignore;
        self
    }

    /// Override the attempt count
    #[must_use]
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    /// Use `session_id` on the wire
    #[must_use]
    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// HTTP access to one package source
pub struct HttpSource {
    source: PackageSource,
    config: HttpSourceConfig,
    transport_factory: Arc<dyn TransportFactory>,
    pipeline: OnceCell<Arc<HandlerPipeline>>,
    throttle: Arc<dyn Throttle>,
    credentials: Arc<SourceCredentials>,
    credential_context: CredentialContext,
    diagnostics: Diagnostics,
    executor: RetryExecutor,
    cache: DiskCache,
}

impl fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSource")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("throttle", &self.throttle)
            .field("initialized", &self.pipeline.initialized())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl HttpSource {
    /// Source using the `reqwest` transport and its own throttle
    pub fn new(source: PackageSource, config: HttpSourceConfig) -> Self {
        let credentials = Arc::new(SourceCredentials::new(source.credentials.clone()));
        let diagnostics = Diagnostics::disabled();
        Self {
            throttle: throttle_for(config.max_concurrent_requests),
            executor: RetryExecutor::new(config.retry.clone(), diagnostics.clone()),
            cache: DiskCache::new(config.http_cache_dir.clone()),
            transport_factory: Arc::new(ReqwestTransportFactory),
            pipeline: OnceCell::new(),
            credential_context: CredentialContext::new(),
            credentials,
            diagnostics,
            source,
            config,
        }
    }

    /// Build the transport with `factory`
    #[must_use]
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Share `throttle` with other sources
    #[must_use]
    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Prompt and cache credentials through `context`
    #[must_use]
    pub fn with_credential_context(mut self, context: CredentialContext) -> Self {
        self.credential_context = context;
        self
    }

    /// Report diagnostic events
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.executor = RetryExecutor::new(self.config.retry.clone(), diagnostics.clone());
        self.diagnostics = diagnostics;
        self
    }

    /// Report disk cache events
    #[must_use]
    pub fn with_cache_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.cache = self.cache.with_observer(observer);
        self
    }

    /// Keep cache lock files in `lock_dir`
    #[must_use]
    pub fn with_lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.cache = self.cache.with_lock_dir(lock_dir);
        self
    }

    /// The package source
    pub fn source(&self) -> &PackageSource {
        &self.source
    }

    /// Source configuration
    pub fn config(&self) -> &HttpSourceConfig {
        &self.config
    }

    /// Credentials currently sent to the source
    pub fn credentials(&self) -> &Arc<SourceCredentials> {
        &self.credentials
    }

    /// Serve `request` from the cache or the network and pass the result to
    /// `process` while the cache entry is locked.
    pub async fn get<F, Fut, T>(&self, request: CachedRequest, process: F, token: &CancellationToken) -> Result<T>
    where
        F: FnOnce(HttpSourceResult) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let context = &request.cache_context;
        let entry = self
            .cache
            .initialize(self.source.url.as_str(), &request.cache_key, context);
        let _lock = self.cache.lock(&entry, token).await?;

        let mut rejected = false;
        if !context.refresh && !context.direct_download {
            if let Some(hit) = self.cache.read(&entry).await? {
                let valid = match &request.content_validator {
                    Some(validator) => match self.cache.validate(hit.path(), validator).await {
                        Ok(()) => true,
                        Err(e) if e.is_cancelled() => return Err(e.into()),
                        Err(e) => {
                            warn!("  Invalid cache entry for {}: {e}", request.uri);
                            false
                        }
                    },
                    None => true,
                };

                if valid {
                    info!("  CACHE {}", request.uri);
                    self.diagnostics.emit(DiagnosticEvent::CacheHit {
                        source: self.source.name.clone(),
                        url: request.uri.clone(),
                    });
                    return process(HttpSourceResult::from_file(HttpSourceResultStatus::OpenedFromDisk, hit)).await;
                }
                rejected = true;
            }
        }

        let mut stale = None;
        if let Some(window) = self.config.if_modified_since_window
            && !rejected
            && !context.refresh
            && !context.direct_download
            && let Some(existing) = self.cache.read_any(&entry).await?
        {
            // A future write time is not plausible
            if let Ok(age) = SystemTime::now().duration_since(existing.last_modified())
                && age <= window
            {
                stale = Some(existing);
            }
        }

        let since = stale.as_ref().map(CachedFile::last_modified);
        let throttled = self.send_throttled(request.to_source_request(since), token).await?;
        let (response, _slot) = throttled.into_parts();
        let status = response.status();

        if status == StatusCode::NOT_FOUND && request.ignore_not_found {
            return process(HttpSourceResult::empty(HttpSourceResultStatus::NotFound)).await;
        }
        if status == StatusCode::NO_CONTENT {
            return process(HttpSourceResult::empty(HttpSourceResultStatus::NoContent)).await;
        }
        if status == StatusCode::NOT_MODIFIED
            && let Some(existing) = stale
        {
            drop(response);
            debug!("  Not modified {}", request.uri);
            if let Err(e) = self.cache.touch(&entry).await {
                warn!("Could not refresh {}: {e}", entry.cache_file().display());
            }
            self.diagnostics.emit(DiagnosticEvent::NotModified {
                source: self.source.name.clone(),
                url: request.uri.clone(),
            });
            return process(HttpSourceResult::from_file(HttpSourceResultStatus::OpenedFromDisk, existing)).await;
        }

        let response = response.error_for_status()?;
        if context.direct_download {
            return process(HttpSourceResult {
                status: HttpSourceResultStatus::OpenedFromNetwork,
                cache_file: None,
                stream: Some(Box::pin(StreamReader::new(response.into_body()))),
            })
            .await;
        }

        // The stale file must be closed so the commit may replace it
        drop(stale);
        let committed = self
            .cache
            .write(&entry, response.into_body(), request.content_validator.as_ref(), token)
            .await
            .map_err(|e| match e {
                CacheError::Io(io) => ProtocolError::Io(io),
                other => other.into(),
            })?;

        process(HttpSourceResult::from_file(HttpSourceResultStatus::OpenedFromDisk, committed)).await
    }

    /// Send `request` and pass the body to `process`.
    ///
    /// `process` receives `None` for 204 and, with `ignore_not_found`, for
    /// 404. Other failing statuses are errors.
    pub async fn process_stream<F, Fut, T>(
        &self,
        request: HttpSourceRequest,
        process: F,
        token: &CancellationToken,
    ) -> Result<T>
    where
        F: FnOnce(Option<BodyReader>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ignore_not_found = request.ignore_not_found;
        self.process_response(
            request,
            |response| async move {
                let status = response.status();
                if status == StatusCode::NO_CONTENT || (ignore_not_found && status == StatusCode::NOT_FOUND) {
                    return process(None).await;
                }
                let response = response.error_for_status()?;
                process(Some(Box::pin(StreamReader::new(response.into_body())))).await
            },
            token,
        )
        .await
    }

    /// Send `request` and pass the raw response to `process`, whatever its
    /// status
    pub async fn process_response<F, Fut, T>(
        &self,
        request: HttpSourceRequest,
        process: F,
        token: &CancellationToken,
    ) -> Result<T>
    where
        F: FnOnce(HttpResponse) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (response, _slot) = self.send_throttled(request, token).await?.into_parts();
        process(response).await
    }

    /// GET `uri` as JSON. `None` for 204 and, with `ignore_not_found`, 404.
    pub async fn get_json(
        &self,
        uri: Url,
        ignore_not_found: bool,
        token: &CancellationToken,
    ) -> Result<Option<serde_json::Value>> {
        let request = HttpSourceRequest::get(uri)
            .with_accept("application/json")
            .with_ignore_not_found(ignore_not_found);

        self.process_stream(
            request,
            |body| async move {
                let Some(mut body) = body else {
                    return Ok(None);
                };
                let mut buffer = Vec::new();
                body.read_to_end(&mut buffer).await?;
                Ok(Some(serde_json::from_slice(&buffer)?))
            },
            token,
        )
        .await
    }

    async fn pipeline(&self) -> Result<Arc<HandlerPipeline>> {
        let pipeline = self
            .pipeline
            .get_or_try_init(|| async {
                let transport = self.transport_factory.create(&self.config).await?;
                Ok::<_, ProtocolError>(Arc::new(HandlerPipeline::for_source(
                    transport,
                    &self.source,
                    &self.config,
                    &self.credential_context,
                    Arc::clone(&self.credentials),
                )))
            })
            .await?;
        Ok(Arc::clone(pipeline))
    }

    async fn send_throttled(&self, request: HttpSourceRequest, token: &CancellationToken) -> Result<ThrottledResponse> {
        let client = self.pipeline().await?;
        let session_id = request.session_id.unwrap_or_else(Uuid::new_v4);

        let mut extra_headers = HeaderMap::new();
        extra_headers.insert(
            SESSION_ID_HEADER,
            HeaderValue::from_str(&session_id.to_string())
                .map_err(|e| ProtocolError::InvalidHeader(format!("{SESSION_ID_HEADER}: {e}")))?,
        );

        let base = Arc::clone(&request.request_factory);
        let accept = request.accept.clone();
        let prompt_on_403 = self.config.prompt_on_403;
        let request_factory: RequestFactory = Arc::new(move || {
            let mut attempt = base()?;
            for media_type in &accept {
                attempt.append_header("Accept", media_type)?;
            }
            attempt.options.prompt_on_403 |= prompt_on_403;
            attempt.options.correlation_id.get_or_insert(session_id);
            Ok(attempt)
        });

        let retry = RetryRequest {
            client,
            request_factory,
            max_tries: request.max_tries.unwrap_or(self.config.retry.max_tries).max(1),
            request_timeout: request.request_timeout.unwrap_or(self.config.request_timeout),
            download_timeout: request.download_timeout.unwrap_or(self.config.download_timeout),
            retry_delay: self.config.retry.retry_delay,
            extra_headers,
            is_retry: request.is_retry,
            is_last_attempt: request.is_last_attempt,
        };

        let slot = ThrottleSlot::acquire(Arc::clone(&self.throttle), token).await?;
        let response = self.executor.send(retry, &self.source.name, token).await?;
        Ok(ThrottledResponse::new(response, slot))
    }
}
