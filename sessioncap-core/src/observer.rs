//! Seam for the DOM observation pipeline.
//!
//! Observation, sanitizing and node bookkeeping live outside this crate.
//! The orchestrator arms them on start and tears them down on stop through
//! this trait; every hook defaults to doing nothing.

use crate::app::WeakApp;

pub trait Observer: Send + Sync {
    /// Begin producing messages. Send them through `app`.
    fn observe(&self, _app: WeakApp) {}

    /// Stop producing messages.
    fn disconnect(&self) {}

    /// Forget accumulated content state (sanitizer).
    fn clear_content(&self) {}

    /// Forget node bookkeeping.
    fn clear_nodes(&self) {}
}

/// Observer for hosts that feed messages in by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
