//! A concrete [`Task`] implementation for plain synchronous work, plus the
//! continuation-chaining helper used throughout the async executor.
//!
//! spec.md §3 describes a task as carrying a cancel flag, a stored
//! exception, and an optional continuation fetched once the body finishes.
//! `ClosureTask` is the simplest thing satisfying that contract: a boxed
//! `FnOnce`, run on a caller-supplied [`crate::pool::ThreadPool`], with an
//! optional follow-up task installed before scheduling.

use std::sync::{Arc, Mutex};

use crate::error::StoredFailure;
use crate::pool::ThreadPool;
use crate::queue::{ReadyCallback, Task};

enum Body<T> {
    Pending(Box<dyn FnOnce() -> Result<T, StoredFailure> + Send>),
    Taken,
}

/// Runs a single `FnOnce` closure on a [`ThreadPool`], recording its result
/// and exposing it to the owning [`crate::queue::ExecutionQueue`] via the
/// [`Task`] contract.
pub struct ClosureTask<T: Send + 'static> {
    pool: Arc<ThreadPool>,
    body: Mutex<Body<T>>,
    output: Mutex<Option<T>>,
    failure: Mutex<Option<StoredFailure>>,
    continuation: Mutex<Option<Arc<dyn Task>>>,
    completed: std::sync::atomic::AtomicBool,
    cancel_requested: std::sync::atomic::AtomicBool,
}

impl<T: Send + 'static> ClosureTask<T> {
    pub fn new(
        pool: Arc<ThreadPool>,
        body: impl FnOnce() -> Result<T, StoredFailure> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(ClosureTask {
            pool,
            body: Mutex::new(Body::Pending(Box::new(body))),
            output: Mutex::new(None),
            failure: Mutex::new(None),
            continuation: Mutex::new(None),
            completed: std::sync::atomic::AtomicBool::new(false),
            cancel_requested: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Installs a follow-up task to run once this one completes. Must be
    /// called before the task is pushed onto a queue.
    pub fn set_continuation(&self, task: Arc<dyn Task>) {
        *self.continuation.lock().unwrap() = Some(task);
    }

    pub fn take_output(&self) -> Option<T> {
        self.output.lock().unwrap().take()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl<T: Send + 'static> Task for ClosureTask<T> {
    fn schedule(self: Arc<Self>, on_ready: ReadyCallback) {
        let body = {
            let mut guard = self.body.lock().unwrap();
            std::mem::replace(&mut *guard, Body::Taken)
        };
        let Body::Pending(body) = body else {
            // Already scheduled once; fire on_ready so the queue doesn't
            // hang, but this indicates a caller bug.
            on_ready();
            return;
        };
        let this = Arc::clone(&self);
        self.pool.execute(move || {
            let result = body();
            match result {
                Ok(value) => {
                    *this.output.lock().unwrap() = Some(value);
                }
                Err(err) => {
                    *this.failure.lock().unwrap() = Some(err);
                }
            }
            this.completed
                .store(true, std::sync::atomic::Ordering::SeqCst);
            on_ready();
        });
    }

    fn continuation(&self) -> Result<Option<Arc<dyn Task>>, StoredFailure> {
        Ok(self.continuation.lock().unwrap().take())
    }

    fn take_failure(&self) -> Option<StoredFailure> {
        self.failure.lock().unwrap().take()
    }

    fn is_failed(&self) -> bool {
        self.failure.lock().unwrap().is_some()
    }

    fn request_cancel(&self) {
        self.cancel_requested
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A task whose body is "call this callback" — used for the completion
/// queue, where entries exist purely to run a caller-supplied closure on the
/// shared thread pool and never carry a continuation or a stored failure.
pub struct CallbackTask {
    pool: Arc<ThreadPool>,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CallbackTask {
    pub fn new(pool: Arc<ThreadPool>, callback: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(CallbackTask {
            pool,
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }
}

impl Task for CallbackTask {
    fn schedule(self: Arc<Self>, on_ready: ReadyCallback) {
        let callback = self.callback.lock().unwrap().take();
        self.pool.execute(move || {
            if let Some(callback) = callback {
                callback();
            }
            on_ready();
        });
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
