//! Host capabilities: wall clock and document state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

/// Source of capture timestamps.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// The host document as seen by the tracker.
pub trait Document: Send + Sync {
    /// Watch of the document's `hidden` flag.
    fn hidden(&self) -> watch::Receiver<bool>;

    /// Document base URI, when the host has one.
    fn base_uri(&self) -> Option<String> {
        None
    }

    /// Current document location.
    fn location(&self) -> Option<String> {
        None
    }
}

/// Document whose state is driven by the embedding host.
pub struct HostDocument {
    hidden: watch::Sender<bool>,
    base_uri: Mutex<Option<String>>,
    location: Mutex<Option<String>>,
}

impl HostDocument {
    /// A visible document with no base URI or location.
    pub fn new() -> Self {
        let (hidden, _) = watch::channel(false);
        Self {
            hidden,
            base_uri: Mutex::new(None),
            location: Mutex::new(None),
        }
    }

    pub fn with_location(location: impl Into<String>) -> Self {
        let document = Self::new();
        document.set_location(Some(location.into()));
        document
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.send_replace(hidden);
    }

    pub fn is_hidden(&self) -> bool {
        *self.hidden.borrow()
    }

    pub fn set_base_uri(&self, base_uri: Option<String>) {
        *self.base_uri.lock().unwrap_or_else(PoisonError::into_inner) = base_uri;
    }

    pub fn set_location(&self, location: Option<String>) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = location;
    }
}

impl Default for HostDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Document for HostDocument {
    fn hidden(&self) -> watch::Receiver<bool> {
        self.hidden.subscribe()
    }

    fn base_uri(&self) -> Option<String> {
        self.base_uri
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn location(&self) -> Option<String> {
        self.location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Resource hints reported to the ingest service at session start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceHints {
    /// Approximate device memory in gigabytes
    pub device_memory: Option<f64>,
    /// Heap size limit of the host runtime in bytes
    pub js_heap_size_limit: Option<u64>,
}
