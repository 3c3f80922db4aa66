//! Manual redirect handling.
//!
//! Used when the transport does not follow redirects. Unlike the transport's
//! own policy this refuses to leave https for http and never forwards the
//! `Authorization` header to the new location.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderName, LOCATION};
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::{Interceptor, Next};
use crate::error::Result;
use crate::message::{HttpRequest, HttpResponse};

/// Follows 300, 301, 302, 303 and 307 responses
#[derive(Debug, Clone, Copy)]
pub struct RedirectInterceptor {
    max_redirects: usize,
}

impl RedirectInterceptor {
    /// Follow at most `max_redirects` hops
    pub fn new(max_redirects: usize) -> Self {
        Self { max_redirects }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MULTIPLE_CHOICES
            | StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
    )
}

/// Whether following `status` turns `method` into GET
fn downgrades_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::MULTIPLE_CHOICES | StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
            *method == Method::POST
        }
        StatusCode::SEE_OTHER => *method != Method::GET && *method != Method::HEAD,
        _ => false,
    }
}

/// Resolve `location` against `base`, keeping the base fragment when the
/// target has none
fn resolve(base: &Url, location: &str) -> Option<Url> {
    let mut target = base.join(location).ok()?;
    if target.fragment().is_none()
        && let Some(fragment) = base.fragment()
    {
        target.set_fragment(Some(fragment));
    }
    Some(target)
}

fn strip_content_headers(request: &mut HttpRequest) {
    let content: Vec<HeaderName> = request
        .headers
        .keys()
        .filter(|name| name.as_str().starts_with("content-"))
        .cloned()
        .collect();
    for name in content {
        request.headers.remove(name);
    }
}

#[async_trait]
impl Interceptor for RedirectInterceptor {
    async fn intercept(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse> {
        let mut current = request;
        let mut hops = 0;

        loop {
            let response = next.run(current.clone()).await?;
            let status = response.status();
            if !is_redirect(status) {
                return Ok(response);
            }
            let Some(location) = response.header_str(LOCATION.as_str()) else {
                return Ok(response);
            };
            let Some(target) = resolve(&current.url, location) else {
                warn!("Ignoring invalid redirect location '{location}' from {}", current.url);
                return Ok(response);
            };

            if current.url.scheme() == "https" && target.scheme() == "http" {
                warn!(
                    "Refusing to follow redirect from '{}' to '{target}': https to http is not allowed",
                    current.url
                );
                return Ok(response);
            }
            if hops >= self.max_redirects {
                warn!("Stopped following redirects for '{}' after {hops} hops", current.url);
                return Ok(response);
            }
            drop(response);

            debug!("Redirecting {} {} to {target}", status.as_u16(), current.url);
            if downgrades_to_get(status, &current.method) {
                current.method = Method::GET;
                current.body = None;
                strip_content_headers(&mut current);
            }
            current.headers.remove(AUTHORIZATION);
            current.url = target;
            hops += 1;
        }
    }
}
