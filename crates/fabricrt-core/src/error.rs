//! Crate-wide error domain for the execution queue and async executor.
//!
//! Mirrors the error-domain shape used across this codebase: a single enum,
//! `thiserror`-derived, with variants that carry just enough structured
//! context to drive retry/backoff decisions without forcing callers to match
//! on message strings.

use std::fmt;

/// Errors produced by [`crate::queue::ExecutionQueue`] and
/// [`crate::executor::AsyncExecutor`].
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The operation was cancelled, or the owning queue/executor was
    /// disposed while the caller was waiting on it.
    #[error("operation aborted: {reason}")]
    Aborted { reason: &'static str },

    /// A task body returned an error; the queue stores it rather than
    /// propagating it out of `onReady`.
    #[error("task failed: {0}")]
    TaskFailed(Box<dyn std::error::Error + Send + Sync>),

    /// `AsyncExecutor::dispose` was called while outstanding calls remained,
    /// or a caller tried to reuse an operation after release.
    #[error("executor invariant violated: {0}")]
    InvariantViolated(&'static str),
}

impl CoreError {
    pub fn aborted(reason: &'static str) -> Self {
        CoreError::Aborted { reason }
    }

    /// `true` for errors that default sinks should treat as expected and
    /// not log above debug level (spec.md §7, `OperationAborted`).
    pub fn is_expected(&self) -> bool {
        matches!(self, CoreError::Aborted { .. })
    }
}

/// A type-erased, `Send`-able stored failure, used by [`crate::queue::Task`]
/// to carry the result of a failed task body without requiring every task
/// output type to share a common error type.
pub type StoredFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Wraps an arbitrary displayable value as a [`StoredFailure`].
#[derive(Debug)]
pub struct OpaqueFailure(String);

impl OpaqueFailure {
    pub fn new(message: impl fmt::Display) -> Self {
        OpaqueFailure(message.to_string())
    }
}

impl fmt::Display for OpaqueFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for OpaqueFailure {}
