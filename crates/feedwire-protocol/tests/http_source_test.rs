//! Integration tests for HttpSource against a local mock feed

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use feedwire_cache::{CacheEvent, CacheObserver};
use feedwire_protocol::{
    CacheContext, CachedRequest, CredentialContext, CredentialError, CredentialRequestType,
    CredentialService, DiagnosticEvent, Diagnostics, EventLog, HttpSource, HttpSourceConfig,
    HttpSourceResultStatus, NetworkCredential, PackageSource, ProtocolError, RetryPolicy,
    SESSION_ID_HEADER,
};
use feedwire_protocol::transport::ensure_crypto_provider;
use reqwest::StatusCode;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, header_exists, method, path},
};

struct Feed {
    server: MockServer,
    cache_dir: TempDir,
}

impl Feed {
    async fn start() -> Self {
        ensure_crypto_provider();
        Self {
            server: MockServer::start().await,
            cache_dir: TempDir::new().unwrap(),
        }
    }

    fn url(&self, path: &str) -> Url {
        Url::parse(&format!("{}{path}", self.server.uri())).unwrap()
    }

    fn config(&self) -> HttpSourceConfig {
        HttpSourceConfig {
            http_cache_dir: self.cache_dir.path().join("http-cache"),
            retry: RetryPolicy {
                max_tries: 3,
                retry_delay: Duration::from_millis(10),
                retry_429: false,
            },
            ..HttpSourceConfig::default()
        }
    }

    fn source(&self) -> HttpSource {
        self.source_with(self.config())
    }

    fn source_with(&self, config: HttpSourceConfig) -> HttpSource {
        HttpSource::new(PackageSource::new(self.url("/v3/index.json")), config)
            .with_lock_dir(self.cache_dir.path().join("locks"))
    }
}

async fn fetch(
    source: &HttpSource,
    request: CachedRequest,
) -> Result<(HttpSourceResultStatus, Vec<u8>), ProtocolError> {
    source
        .get(
            request,
            |result| async move {
                let status = result.status;
                result.read_to_end().await.map(|body| (status, body))
            },
            &CancellationToken::new(),
        )
        .await
}

#[derive(Default)]
struct CommitCounter {
    commits: AtomicUsize,
}

impl CommitCounter {
    fn count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl CacheObserver for CommitCounter {
    fn on_cache_event(&self, event: &CacheEvent) {
        if matches!(event, CacheEvent::Committed { .. }) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn cached(url: Url, key: &str) -> CachedRequest {
    CachedRequest::new(url, key, CacheContext::new().with_max_age(Duration::from_secs(600)))
}

#[tokio::test]
async fn test_second_get_is_served_from_disk() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"version\":\"3.0.0\"}"))
        .expect(1)
        .mount(&feed.server)
        .await;

    let log = Arc::new(EventLog::new());
    let source = feed.source().with_diagnostics(Diagnostics::new(log.clone()));

    let first = fetch(&source, cached(feed.url("/v3/index.json"), "index")).await.unwrap();
    let second = fetch(&source, cached(feed.url("/v3/index.json"), "index")).await.unwrap();

    assert_eq!(first.0, HttpSourceResultStatus::OpenedFromDisk);
    assert_eq!(second.0, HttpSourceResultStatus::OpenedFromDisk);
    assert_eq!(first.1, second.1);
    let hits = log
        .events()
        .iter()
        .filter(|event| matches!(event, DiagnosticEvent::CacheHit { .. }))
        .count();
    assert_eq!(hits, 1);
}

#[tokio::test]
async fn test_not_found_sentinel_and_error() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&feed.server)
        .await;

    let source = feed.source();

    let (status, body) = fetch(
        &source,
        cached(feed.url("/missing.json"), "missing").with_ignore_not_found(true),
    )
    .await
    .unwrap();
    assert_eq!(status, HttpSourceResultStatus::NotFound);
    assert!(body.is_empty());

    let err = fetch(&source, cached(feed.url("/missing.json"), "missing"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::HttpStatus {
            status: StatusCode::NOT_FOUND,
            ..
        }
    ));
}

#[tokio::test]
async fn test_no_content() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&feed.server)
        .await;

    let (status, body) = fetch(&feed.source(), cached(feed.url("/empty"), "empty"))
        .await
        .unwrap();

    assert_eq!(status, HttpSourceResultStatus::NoContent);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_server_errors_are_retried_then_fail() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&feed.server)
        .await;

    let err = fetch(&feed.source(), cached(feed.url("/flaky"), "flaky"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProtocolError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            ..
        }
    ));
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&feed.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&feed.server)
        .await;

    let (status, body) = fetch(&feed.source(), cached(feed.url("/flaky"), "flaky"))
        .await
        .unwrap();

    assert_eq!(status, HttpSourceResultStatus::OpenedFromDisk);
    assert_eq!(body, b"ok");
    assert_eq!(feed.server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_gets_share_one_download() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/index.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"version\":\"3.0.0\"}")
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&feed.server)
        .await;

    let commits = Arc::new(CommitCounter::default());
    let source = Arc::new(feed.source().with_cache_observer(commits.clone()));
    let url = feed.url("/v3/index.json");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let source = Arc::clone(&source);
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            fetch(&source, cached(url, "index")).await
        }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        let (status, body) = handle.await.unwrap().unwrap();
        assert_eq!(status, HttpSourceResultStatus::OpenedFromDisk);
        bodies.push(body);
    }

    assert!(bodies.iter().all(|body| body == b"{\"version\":\"3.0.0\"}"));
    assert_eq!(commits.count(), 1);
    assert_eq!(feed.server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_not_modified_serves_cached_bytes() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/registration/index.json"))
        .and(header_exists("If-Modified-Since"))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .mount(&feed.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/registration/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("original"))
        .mount(&feed.server)
        .await;

    let commits = Arc::new(CommitCounter::default());
    let source = feed
        .source_with(HttpSourceConfig {
            if_modified_since_window: Some(Duration::from_secs(600)),
            ..feed.config()
        })
        .with_cache_observer(commits.clone());
    let url = feed.url("/registration/index.json");

    let cache_file = source
        .get(
            cached(url.clone(), "registration"),
            |result| async move { Ok(result.cache_file.clone()) },
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .expect("cached response should have a backing file");
    let first_written = std::fs::metadata(&cache_file).unwrap().modified().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stale = CachedRequest::new(
        url,
        "registration",
        CacheContext::new().with_max_age(Duration::from_millis(1)),
    );
    let (status, body) = fetch(&source, stale).await.unwrap();

    assert_eq!(status, HttpSourceResultStatus::OpenedFromDisk);
    assert_eq!(body, b"original");
    // Revalidation refreshes the timestamp without writing a new body
    assert_eq!(commits.count(), 1);
    let refreshed = std::fs::metadata(&cache_file).unwrap().modified().unwrap();
    assert!(refreshed > first_written);
    let requests = feed.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].headers.contains_key("if-modified-since"));
    assert!(requests[1].headers.contains_key("if-modified-since"));
}

#[tokio::test]
async fn test_direct_download_bypasses_cache() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/package.nupkg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64 * 1024]))
        .expect(2)
        .mount(&feed.server)
        .await;

    let source = feed.source();
    let request = || {
        CachedRequest::new(
            feed.url("/package.nupkg"),
            "package",
            CacheContext::new()
                .with_max_age(Duration::from_secs(600))
                .with_direct_download(true),
        )
    };

    let (status, body) = fetch(&source, request()).await.unwrap();
    assert_eq!(status, HttpSourceResultStatus::OpenedFromNetwork);
    assert_eq!(body.len(), 64 * 1024);

    // Nothing was committed, so the second request goes to the network too
    fetch(&source, request()).await.unwrap();
}

#[tokio::test]
async fn test_session_id_and_accept_are_sent() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/index.json"))
        .and(header("Accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&feed.server)
        .await;

    let context = CacheContext::new().with_max_age(Duration::from_secs(600));
    let session_id = context.session_id;
    let request = CachedRequest::new(feed.url("/v3/index.json"), "index", context)
        .with_accept("application/json");

    fetch(&feed.source(), request).await.unwrap();

    let requests = feed.server.received_requests().await.unwrap();
    let sent = requests[0]
        .headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    assert_eq!(sent, Some(session_id.to_string()));
}

struct CountingCredentials {
    prompts: AtomicUsize,
}

#[async_trait]
impl CredentialService for CountingCredentials {
    async fn get_credentials(
        &self,
        _uri: &Url,
        _proxy: Option<&Url>,
        request_type: CredentialRequestType,
        _message: &str,
        _token: &CancellationToken,
    ) -> Result<Option<NetworkCredential>, CredentialError> {
        assert_eq!(request_type, CredentialRequestType::Unauthorized);
        self.prompts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(NetworkCredential::new("reader", "s3cret")))
    }
}

#[tokio::test]
async fn test_unauthorized_prompts_and_retries_with_credentials() {
    let feed = Feed::start().await;
    let expected = NetworkCredential::new("reader", "s3cret").basic_auth_header();
    Mock::given(method("GET"))
        .and(path("/private/index.json"))
        .and(header("Authorization", expected.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string("private"))
        .with_priority(1)
        .mount(&feed.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private/index.json"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&feed.server)
        .await;

    let service = Arc::new(CountingCredentials {
        prompts: AtomicUsize::new(0),
    });
    let source = feed
        .source()
        .with_credential_context(CredentialContext::new().with_service(service.clone()));

    let (status, body) = fetch(&source, cached(feed.url("/private/index.json"), "private"))
        .await
        .unwrap();

    assert_eq!(status, HttpSourceResultStatus::OpenedFromDisk);
    assert_eq!(body, b"private");
    assert_eq!(service.prompts.load(Ordering::SeqCst), 1);
    assert_eq!(
        source.credentials().get(),
        Some(NetworkCredential::new("reader", "s3cret"))
    );
}

#[tokio::test]
async fn test_cancelled_request_does_not_reach_server() {
    let feed = Feed::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&feed.server)
        .await;

    let token = CancellationToken::new();
    token.cancel();

    let err = feed
        .source()
        .get(
            cached(feed.url("/v3/index.json"), "index"),
            |result| async move { result.read_to_end().await },
            &token,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::Cancelled));
}
