//! Best-effort diagnostic channel.
//!
//! Every failure the runtime absorbs (callback faults, failed starts, worker
//! startup problems) is reported here as a `{context, error}` pair. The
//! default sink logs the report and, when a debug endpoint is configured,
//! beacons it to that endpoint without waiting for the response.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Receiver of absorbed failures.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, context: &str, error: &str);
}

/// Body of a debug beacon.
#[derive(Debug, Serialize)]
struct DebugReport<'a> {
    context: &'a str,
    error: &'a str,
}

/// Logs every report and optionally POSTs it to a debug endpoint.
pub struct Diagnostics {
    endpoint: Option<String>,
    http_client: Option<reqwest::Client>,
}

impl Diagnostics {
    pub fn new(endpoint: Option<String>) -> Self {
        let http_client = endpoint.as_ref().and_then(|_| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| tracing::warn!(error = %e, "Debug report client unavailable"))
                .ok()
        });
        Self {
            endpoint,
            http_client,
        }
    }

    fn beacon(&self, context: &str, error: &str) {
        let (Some(endpoint), Some(client)) = (&self.endpoint, &self.http_client) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(context, "No runtime available, debug report not sent");
            return;
        };
        let request = client
            .post(endpoint)
            .json(&DebugReport { context, error });
        handle.spawn(async move {
            if let Err(e) = request.send().await {
                tracing::debug!(error = %e, "Debug report delivery failed");
            }
        });
    }
}

impl DiagnosticSink for Diagnostics {
    fn report(&self, context: &str, error: &str) {
        tracing::error!(context, error, "sessioncap error");
        self.beacon(context, error);
    }
}

/// Sink that keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far, oldest first.
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl DiagnosticSink for MemorySink {
    fn report(&self, context: &str, error: &str) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((context.to_string(), error.to_string()));
    }
}
