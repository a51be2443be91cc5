//! Host event targets and listener registrations.
//!
//! An [`EventTarget`] is anything the tracker can hang listeners on (the
//! window, the document). Listeners are identified by their `Arc`, so the
//! exact handle that was added is the one that gets removed.

use std::sync::{Arc, Mutex, PoisonError};

use crate::safe::CallbackResult;

/// A host event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// Listener callback.
pub type Listener = Arc<dyn Fn(&Event) -> CallbackResult + Send + Sync>;

/// Something listeners can be attached to.
pub trait EventTarget: Send + Sync {
    fn add_listener(&self, event_type: &str, listener: Listener, capture: bool);
    fn remove_listener(&self, event_type: &str, listener: &Listener, capture: bool);
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// One (target, type, listener, capture) pairing.
#[derive(Clone)]
pub struct ListenerRegistration {
    target: Arc<dyn EventTarget>,
    event_type: String,
    listener: Listener,
    capture: bool,
}

impl ListenerRegistration {
    pub fn new(
        target: Arc<dyn EventTarget>,
        event_type: impl Into<String>,
        listener: Listener,
        capture: bool,
    ) -> Self {
        Self {
            target,
            event_type: event_type.into(),
            listener,
            capture,
        }
    }

    pub fn attach(&self) {
        self.target
            .add_listener(&self.event_type, self.listener.clone(), self.capture);
    }

    pub fn detach(&self) {
        self.target
            .remove_listener(&self.event_type, &self.listener, self.capture);
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

struct Entry {
    event_type: String,
    listener: Listener,
    capture: bool,
}

/// In-process event target.
///
/// Mirrors DOM semantics: adding the same (type, listener, capture) twice
/// registers it once, and capture listeners run before bubble listeners.
#[derive(Default)]
pub struct EventBus {
    entries: Mutex<Vec<Entry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every matching listener.
    ///
    /// A listener returning `Err` is logged and dispatch continues. Panics
    /// are not caught here; listeners attached by the tracker are wrapped
    /// before they reach the bus.
    pub fn dispatch(&self, event: &Event) {
        let mut matching: Vec<(bool, Listener)> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|e| e.event_type == event.event_type)
                .map(|e| (e.capture, e.listener.clone()))
                .collect()
        };
        // Stable sort keeps registration order within each phase.
        matching.sort_by_key(|(capture, _)| !*capture);

        for (_, listener) in matching {
            if let Err(e) = listener(event) {
                tracing::warn!(event_type = %event.event_type, error = %e, "Uncaught listener error");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn listener_count_for(&self, event_type: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventTarget for EventBus {
    fn add_listener(&self, event_type: &str, listener: Listener, capture: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let exists = entries.iter().any(|e| {
            e.event_type == event_type && e.capture == capture && same_listener(&e.listener, &listener)
        });
        if !exists {
            entries.push(Entry {
                event_type: event_type.to_string(),
                listener,
                capture,
            });
        }
    }

    fn remove_listener(&self, event_type: &str, listener: &Listener, capture: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| {
            !(e.event_type == event_type && e.capture == capture && same_listener(&e.listener, listener))
        });
    }
}
