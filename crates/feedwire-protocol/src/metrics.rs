//! Prometheus metrics for HTTP sources

use feedwire_cache::{CacheEvent, CacheObserver};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink};

/// Prometheus-backed diagnostics sink.
///
/// Register it as the [`DiagnosticsSink`] of a source and, optionally, as
/// the [`CacheObserver`] of its disk cache.
#[derive(Debug)]
pub struct HttpMetrics {
    registry: Registry,

    // Request metrics
    requests: IntCounterVec,
    retries: IntCounter,
    cancellations: IntCounter,
    header_latency: Histogram,

    // Cache metrics
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_rejections: IntCounter,
    not_modified: IntCounter,

    // Download metrics
    bytes_downloaded: IntCounter,
    downloads_completed: IntCounter,
}

impl HttpMetrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("feedwire_http_requests_total", "HTTP attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let retries = IntCounter::new(
            "feedwire_http_retries_total",
            "HTTP attempts that were retries of an earlier attempt",
        )?;
        registry.register(Box::new(retries.clone()))?;

        let cancellations = IntCounter::new(
            "feedwire_http_cancellations_total",
            "HTTP attempts cancelled by the caller",
        )?;
        registry.register(Box::new(cancellations.clone()))?;

        let header_latency = Histogram::with_opts(
            HistogramOpts::new(
                "feedwire_http_header_seconds",
                "Time until response headers arrived",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 100.0]),
        )?;
        registry.register(Box::new(header_latency.clone()))?;

        let cache_hits = IntCounter::new("feedwire_cache_hits_total", "Requests served from the disk cache")?;
        registry.register(Box::new(cache_hits.clone()))?;

        let cache_misses = IntCounter::new(
            "feedwire_cache_misses_total",
            "Cache reads that found no fresh entry",
        )?;
        registry.register(Box::new(cache_misses.clone()))?;

        let cache_rejections = IntCounter::new(
            "feedwire_cache_rejections_total",
            "Cached or downloaded content rejected by a validator",
        )?;
        registry.register(Box::new(cache_rejections.clone()))?;

        let not_modified = IntCounter::new(
            "feedwire_http_not_modified_total",
            "Conditional requests answered with 304",
        )?;
        registry.register(Box::new(not_modified.clone()))?;

        let bytes_downloaded = IntCounter::new(
            "feedwire_http_bytes_downloaded_total",
            "Response body bytes read from the network",
        )?;
        registry.register(Box::new(bytes_downloaded.clone()))?;

        let downloads_completed = IntCounter::new(
            "feedwire_http_downloads_completed_total",
            "Response bodies read to the end",
        )?;
        registry.register(Box::new(downloads_completed.clone()))?;

        Ok(Self {
            registry,
            requests,
            retries,
            cancellations,
            header_latency,
            cache_hits,
            cache_misses,
            cache_rejections,
            not_modified,
            bytes_downloaded,
            downloads_completed,
        })
    }

    /// Registry for serving metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}

impl DiagnosticsSink for HttpMetrics {
    fn on_event(&self, event: &DiagnosticEvent) {
        match event {
            DiagnosticEvent::Request(request) => {
                let outcome = if request.is_cancelled {
                    self.cancellations.inc();
                    "cancelled"
                } else if request.is_success {
                    "success"
                } else {
                    "failure"
                };
                self.requests.with_label_values(&[outcome]).inc();
                if request.is_retry {
                    self.retries.inc();
                }
                if let Some(duration) = request.header_duration {
                    self.header_latency.observe(duration.as_secs_f64());
                }
            }
            DiagnosticEvent::CacheHit { .. } => self.cache_hits.inc(),
            DiagnosticEvent::NotModified { .. } => self.not_modified.inc(),
            DiagnosticEvent::DownloadCompleted { bytes, .. } => {
                self.downloads_completed.inc();
                self.bytes_downloaded.inc_by(*bytes);
            }
        }
    }
}

impl CacheObserver for HttpMetrics {
    fn on_cache_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Miss { .. } => self.cache_misses.inc(),
            CacheEvent::Rejected { .. } => self.cache_rejections.inc(),
            // Hits are counted once they are served
            CacheEvent::Hit { .. } | CacheEvent::Committed { .. } => {}
        }
    }
}
