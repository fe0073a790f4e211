//! Task dispatch for flusher continuations and deferred completions.
//!
//! The driver never spawns threads itself; short continuation tasks are
//! handed to an [`Executor`]. A rejected dispatch is reported to the caller,
//! which logs and degrades to best-effort (the connection still terminates
//! through the idle timeout or transport teardown).

use thiserror::Error;

/// Dispatch was refused, e.g. because the runtime is shutting down.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("task dispatch rejected")]
pub struct ExecuteError;

/// Minimal task-dispatch capability.
pub trait Executor: Send + Sync {
    /// Run `task` soon, on some other call stack.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError`] when the task cannot be dispatched; the task
    /// is dropped.
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> Result<(), ExecuteError>;
}

/// [`Executor`] backed by a Tokio runtime handle.
#[derive(Clone, Debug)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    /// Dispatch onto the given runtime.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self { Self { handle } }

    /// Dispatch onto the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime, like
    /// [`Handle::current`](tokio::runtime::Handle::current).
    #[must_use]
    pub fn current() -> Self { Self::new(tokio::runtime::Handle::current()) }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> Result<(), ExecuteError> {
        self.handle.spawn(async move { task() });
        Ok(())
    }
}
