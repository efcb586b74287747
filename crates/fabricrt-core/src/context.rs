//! Cooperative cancellation context.
//!
//! The original spec treats cancellation as "a request flag, not a terminal
//! state" (spec.md §3) propagated cooperatively (spec.md §5). `CallContext`
//! is the minimal carrier for that flag plus an optional deadline, shared by
//! the execution queue, the async executor, and (transitively) the
//! messaging client and bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
}

/// A cheap, cloneable handle to a single cancellation flag.
///
/// Cloning shares the same underlying flag: requesting cancellation through
/// any clone is observed by all of them. This is the "cancel flag" mentioned
/// in the Task data model (spec.md §3) — cancellation is a request, never a
/// terminal state by itself.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-call context threaded through EQ/AE operations that need to observe
/// cancellation or a deadline.
#[derive(Clone, Debug)]
pub struct CallContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        CallContext {
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        CallContext {
            cancellation: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}
