//! Fault isolation for externally supplied callbacks.
//!
//! A callback fails either by returning `Err` or by panicking. Both are
//! caught at the boundary, reported to the [`DiagnosticSink`], and the
//! wrapped call returns normally.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::diagnostics::DiagnosticSink;

/// Error a callback may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a callback.
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Context under which wrapped-function faults are reported.
pub const SAFE_FN_CONTEXT: &str = "safe_fn_call";

/// Run `f`, absorbing any failure.
///
/// Returns `true` when `f` completed without error.
pub fn guard<F>(sink: &dyn DiagnosticSink, context: &str, f: F) -> bool
where
    F: FnOnce() -> CallbackResult,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            sink.report(context, &e.to_string());
            false
        }
        Err(payload) => {
            sink.report(context, &panic_message(payload.as_ref()));
            false
        }
    }
}

/// Wrap a one-argument callback so it can never fail.
///
/// The returned function has the same signature and always yields `Ok(())`.
pub fn safe<A, F>(sink: Arc<dyn DiagnosticSink>, f: F) -> impl Fn(A) -> CallbackResult + Send + Sync
where
    F: Fn(A) -> CallbackResult + Send + Sync,
{
    move |arg: A| {
        guard(sink.as_ref(), SAFE_FN_CONTEXT, || f(arg));
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
