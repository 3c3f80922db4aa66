//! Forwards server warnings to the log

use async_trait::async_trait;
use tracing::warn;

use super::{Interceptor, Next};
use crate::error::Result;
use crate::message::{HttpRequest, HttpResponse};

/// Header carrying human-readable server warnings
pub const WARNING_HEADER: &str = "X-NuGet-Warning";

/// Logs every [`WARNING_HEADER`] value at `warn`
#[derive(Debug, Clone, Copy, Default)]
pub struct WarningInterceptor;

#[async_trait]
impl Interceptor for WarningInterceptor {
    async fn intercept(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse> {
        let response = next.run(request).await?;
        for value in response.headers().get_all(WARNING_HEADER) {
            if let Ok(message) = value.to_str() {
                warn!("{message}");
            }
        }
        Ok(response)
    }
}
