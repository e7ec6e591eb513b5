//! Error types and the process-wide hook for panics escaping user tasks.

use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

use crate::task::Job;

/// Errors surfaced by submission and configuration entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Caller-side violation detected before any state was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Submission after `shutdown()` or `shutdown_now()`.
    #[error("scheduler has been shut down")]
    Rejected,
}

/// Hook receiving panics that escape user task bodies.
///
/// Arguments are the worker thread's name and the rendered panic message.
pub type UncaughtPanicHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

static UNCAUGHT_HANDLER: RwLock<Option<UncaughtPanicHandler>> = RwLock::new(None);

/// Installs the process-wide uncaught-panic hook.
///
/// Panics escaping task bodies are caught by the worker, rendered, and handed
/// here; the worker then continues with its next task. Without an installed
/// hook the panic is logged at error level.
pub fn set_uncaught_panic_handler(handler: UncaughtPanicHandler) {
    *UNCAUGHT_HANDLER.write() = Some(handler);
}

/// Renders a panic payload the way the panic machinery would print it.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Forwards an escaped panic to the installed hook.
pub(crate) fn forward_panic(payload: Box<dyn Any + Send>) {
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("<unnamed>");
    let message = panic_message(payload.as_ref());
    let handler = UNCAUGHT_HANDLER.read().clone();
    match handler {
        Some(handler) => handler(name, &message),
        None => tracing::error!(thread = name, panic = %message, "task panicked"),
    }
}

/// Runs a job, converting a panic into a call to the uncaught hook.
///
/// The guard is what lets one misbehaving task leave the worker thread and
/// any per-key chain behind it intact.
pub(crate) fn run_job_guarded(job: &Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.call())) {
        forward_panic(payload);
    }
}
