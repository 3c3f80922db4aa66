//! Request and response types that flow through the handler pipeline.
//!
//! Requests are plain data with an in-memory body so they can be cloned for
//! every attempt. Response bodies are streams and are consumed once.

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use url::Url;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Header naming the logical operation a request belongs to
pub const SESSION_ID_HEADER: &str = "X-NuGet-Session-Id";

/// Per-request knobs read by interceptors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Treat 403 like 401 and prompt for credentials
    pub prompt_on_403: bool,
    /// Scope for authentication bookkeeping
    pub correlation_id: Option<Uuid>,
}

/// An outgoing HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method
    pub method: Method,
    /// Target URL
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// In-memory body
    pub body: Option<Bytes>,
    /// Interceptor options
    pub options: RequestOptions,
}

impl HttpRequest {
    /// Create a request with no headers or body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    /// Create a GET request
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header, keeping existing values for the same name
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProtocolError::InvalidHeader(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProtocolError::InvalidHeader(format!("{name}: {e}")))?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Set the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set interceptor options
    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Correlation scope, or the nil id when none was set
    pub fn correlation_id(&self) -> Uuid {
        self.options.correlation_id.unwrap_or(Uuid::nil())
    }
}

/// Streaming response body
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// A received HTTP response
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: BodyStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Create a response around a body stream
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            url,
            body,
        }
    }

    /// Create a response with an in-memory body
    pub fn from_bytes(status: StatusCode, url: Url, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let stream = if body.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(body) }).boxed()
        };
        Self::new(status, HeaderMap::new(), url, stream)
    }

    /// Create a response with an empty body
    pub fn empty(status: StatusCode, url: Url) -> Self {
        Self::new(status, HeaderMap::new(), url, stream::empty().boxed())
    }

    /// Response status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// URL of the request that produced this response
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// First value of a header as a string
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Fail with [`ProtocolError::HttpStatus`] unless the status is 2xx
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ProtocolError::HttpStatus {
                status: self.status,
                url: self.url,
            })
        }
    }

    /// Replace the body stream, keeping status and headers
    #[must_use]
    pub fn map_body<F>(self, f: F) -> Self
    where
        F: FnOnce(BodyStream) -> BodyStream,
    {
        Self {
            body: f(self.body),
            ..self
        }
    }

    /// Take the body stream
    pub fn into_body(self) -> BodyStream {
        self.body
    }

    /// Collect the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        collect(self.body).await
    }
}

async fn collect<S>(mut body: S) -> Result<Bytes>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
