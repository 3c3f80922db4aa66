//! Diagnostic events emitted by the request pipeline.
//!
//! Sinks are injected per source; nothing here is global.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use reqwest::StatusCode;
use url::Url;

/// Outcome of one HTTP attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    /// When the attempt finished
    pub timestamp: SystemTime,
    /// Source display name
    pub source: String,
    /// Request URL
    pub url: Url,
    /// Time until response headers arrived
    pub header_duration: Option<Duration>,
    /// Response status, if one arrived
    pub status: Option<StatusCode>,
    /// Attempt produced a response below 500
    pub is_success: bool,
    /// Attempt was not the first
    pub is_retry: bool,
    /// Attempt ended in caller cancellation
    pub is_cancelled: bool,
    /// No further attempt will be made
    pub is_last_attempt: bool,
}

/// Something observable happened while serving a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// One HTTP attempt completed, failed or was cancelled
    Request(RequestEvent),
    /// A request was served from a fresh cache entry
    CacheHit {
        /// Source display name
        source: String,
        /// Request URL
        url: Url,
    },
    /// A conditional request confirmed the cached entry
    NotModified {
        /// Source display name
        source: String,
        /// Request URL
        url: Url,
    },
    /// A network body was read to the end
    DownloadCompleted {
        /// Source display name
        source: String,
        /// Request URL
        url: Url,
        /// Body size
        bytes: u64,
        /// Time from first poll to end of stream
        duration: Duration,
    },
}

/// Receives [`DiagnosticEvent`]s
pub trait DiagnosticsSink: Send + Sync {
    /// Called inline; keep it cheap
    fn on_event(&self, event: &DiagnosticEvent);
}

/// Optional sink handle threaded through the pipeline
#[derive(Clone, Default)]
pub struct Diagnostics {
    sink: Option<Arc<dyn DiagnosticsSink>>,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}

impl Diagnostics {
    /// Drop every event
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Forward events to `sink`
    pub fn new(sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Forward one event
    pub fn emit(&self, event: DiagnosticEvent) {
        if let Some(sink) = &self.sink {
            sink.on_event(&event);
        }
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl EventLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    /// Recorded request events
    pub fn requests(&self) -> Vec<RequestEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DiagnosticEvent::Request(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }
}

impl DiagnosticsSink for EventLog {
    fn on_event(&self, event: &DiagnosticEvent) {
        self.events.lock().push(event.clone());
    }
}
