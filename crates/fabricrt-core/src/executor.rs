//! Async Executor (AE): an asynchronous-operation façade over two
//! [`ExecutionQueue`]s and a dedicated thread pool.
//!
//! See spec.md §4.2. The executor bounds concurrent execution by thread-pool
//! size (via the workers queue's throttle) and bounds outstanding buffered
//! operations by `max_tasks_multiplier × threads`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{CoreError, StoredFailure};
use crate::pool::ThreadPool;
use crate::queue::{ExecutionQueue, QueueOptions, ReadyCallback, Task};

/// Default ratio between thread-pool size and the number of buffered
/// (pending + executing) operations the workers queue will admit.
pub const MAX_TASKS_MULTIPLIER: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    pub threads: usize,
    pub max_tasks_multiplier: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_tasks_multiplier: MAX_TASKS_MULTIPLIER,
        }
    }
}

/// The opaque per-operation state supplied by a caller of [`AsyncExecutor`].
/// `execute` runs inline on a pool thread; `create_task` may instead hand
/// back an inner task representing async IO, whose completion the worker
/// will wait out before invoking the operation's callback.
pub trait OpState: Send + Sync {
    fn execute(&self) -> Result<(), StoredFailure>;

    fn create_task(&self) -> Option<Arc<dyn Task>> {
        None
    }
}

/// The outcome handed to an operation's callback: either success, or the
/// failure recorded by `execute()` / the inner op-state-task / cancellation.
pub enum CallOutcome {
    Ok,
    Err(CoreError),
}

pub type OperationCallback = Box<dyn FnOnce(CallOutcome) + Send>;

struct WorkerInner {
    calls_expected: u8,
    remaining_to_execute: u8,
    stopped: bool,
    callback: Option<OperationCallback>,
    op_state: Option<Arc<dyn OpState>>,
    op_state_task: Option<Arc<dyn Task>>,
}

/// The reusable, stateful worker ("executor task control block", spec.md
/// §3) that carries a single logical async call chain from execute through
/// callback. Recycled by [`AsyncExecutor`] across operations.
pub struct WorkerTask {
    execute_lock: Mutex<()>,
    inner: Mutex<WorkerInner>,
    pool: Arc<ThreadPool>,
    self_ref: Mutex<Option<Weak<WorkerTask>>>,
    ae: Weak<AsyncExecutorShared>,
}

impl WorkerTask {
    fn new(pool: Arc<ThreadPool>, ae: Weak<AsyncExecutorShared>) -> Arc<Self> {
        let worker = Arc::new(WorkerTask {
            execute_lock: Mutex::new(()),
            inner: Mutex::new(WorkerInner {
                calls_expected: 0,
                remaining_to_execute: 0,
                stopped: false,
                callback: None,
                op_state: None,
                op_state_task: None,
            }),
            pool,
            self_ref: Mutex::new(None),
            ae,
        });
        *worker.self_ref.lock().unwrap() = Some(Arc::downgrade(&worker));
        worker
    }

    /// Rearms the worker for a fresh operation: `calls_expected = 2` (one
    /// real call, one termination call), per spec.md §3.
    fn arm(&self, op_state: Arc<dyn OpState>, callback: OperationCallback) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls_expected = 2;
        inner.remaining_to_execute = 1;
        inner.stopped = false;
        inner.callback = Some(callback);
        inner.op_state = Some(op_state);
        inner.op_state_task = None;
    }

    /// `requestNewAsyncCall`: valid only when no call is currently pending.
    /// Schedules another real call to run on this same worker slot via the
    /// completion queue.
    fn request_new_async_call(self: &Arc<Self>, callback: OperationCallback) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.remaining_to_execute != 0 {
            return Err(CoreError::InvariantViolated(
                "requestNewAsyncCall with a call already pending",
            ));
        }
        inner.calls_expected += 1;
        inner.remaining_to_execute = 1;
        inner.callback = Some(callback);
        drop(inner);

        let Some(ae) = self.ae.upgrade() else {
            return Err(CoreError::aborted("executor disposed"));
        };
        let worker = Arc::clone(self);
        ae.completion_eq.push_back(
            crate::task::CallbackTask::new(Arc::clone(&ae.completion_pool), move || {
                ae_reenter(&ae, worker);
            }),
            false,
        );
        Ok(())
    }

    /// `requestCancel`: see spec.md §4.2 "Cancellation".
    fn request_cancel(self: &Arc<Self>) {
        let action = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopped {
                None
            } else if let Some(task) = inner.op_state_task.clone() {
                Some(Some(task))
            } else {
                inner.stopped = true;
                Some(None)
            }
        };
        match action {
            None => {}
            Some(Some(inner_task)) => inner_task.request_cancel(),
            Some(None) => {
                if let Some(ae) = self.ae.upgrade() {
                    let me = Arc::clone(self) as Arc<dyn Task>;
                    ae.workers_eq.push_back(Arc::clone(&me), false);
                    ae.workers_eq.prioritize(&me);
                }
            }
        }
    }

    fn has_pending_call(&self) -> bool {
        self.inner.lock().unwrap().remaining_to_execute != 0
    }

    /// The per-call body: steps 1-4 of the worker task algorithm.
    fn run_one_call(self: &Arc<Self>) {
        let _execute_guard = self.execute_lock.lock().unwrap();

        enum Step {
            Termination,
            Real {
                callback: Option<OperationCallback>,
                op_state_task: Option<Arc<dyn Task>>,
                stopped: bool,
            },
        }

        let step = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls_expected = inner.calls_expected.saturating_sub(1);
            if inner.calls_expected == 0 {
                inner.op_state = None;
                Step::Termination
            } else {
                Step::Real {
                    callback: inner.callback.take(),
                    op_state_task: inner.op_state_task.take(),
                    stopped: inner.stopped,
                }
            }
        };

        let Step::Real {
            callback,
            op_state_task,
            stopped,
        } = step
        else {
            return;
        };

        let outcome = if stopped {
            CallOutcome::Err(CoreError::aborted("operation aborted"))
        } else if let Some(inner_task) = op_state_task {
            match inner_task.take_failure() {
                Some(failure) => CallOutcome::Err(CoreError::TaskFailed(failure)),
                None => CallOutcome::Ok,
            }
        } else {
            let op_state = self.inner.lock().unwrap().op_state.clone();
            match op_state {
                Some(state) => match state.create_task() {
                    Some(task) => match self.ae.upgrade() {
                        Some(ae) => {
                            // The inner task is a continuation of this call,
                            // not a finished one: bump calls_expected for the
                            // follow-up pass that will consume its outcome,
                            // put the callback back for that pass, and drive
                            // the task itself instead of faking success.
                            {
                                let mut inner = self.inner.lock().unwrap();
                                inner.calls_expected += 1;
                                inner.op_state_task = Some(Arc::clone(&task));
                                inner.callback = callback;
                            }
                            let worker = Arc::clone(self);
                            task.schedule(Box::new(move || {
                                ae_reenter(&ae, worker);
                            }));
                            return;
                        }
                        None => CallOutcome::Err(CoreError::aborted("executor disposed")),
                    },
                    None => match state.execute() {
                        Ok(()) => CallOutcome::Ok,
                        Err(err) => CallOutcome::Err(CoreError::TaskFailed(err)),
                    },
                },
                None => CallOutcome::Ok,
            }
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.remaining_to_execute = 0;
        }

        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

impl Task for WorkerTask {
    fn schedule(self: Arc<Self>, on_ready: ReadyCallback) {
        let pool = Arc::clone(&self.pool);
        let this = Arc::clone(&self);
        pool.execute(move || {
            this.run_one_call();
            on_ready();
        });
    }

    fn continuation(&self) -> Result<Option<Arc<dyn Task>>, StoredFailure> {
        let inner = self.inner.lock().unwrap();
        // A call left `remaining_to_execute != 0` is waiting on an
        // in-progress op-state-task; it is re-queued explicitly once that
        // task completes (see `run_one_call`), not by the queue's normal
        // immediate continuation.
        let still_pending = inner.calls_expected > 0 && inner.remaining_to_execute == 0;
        drop(inner);
        if !still_pending {
            return Ok(None);
        }
        let self_arc = self
            .self_ref
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        Ok(self_arc.map(|arc| arc as Arc<dyn Task>))
    }

    fn request_cancel(&self) {
        if let Some(self_arc) = self.self_ref.lock().unwrap().as_ref().and_then(Weak::upgrade) {
            self_arc.request_cancel();
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn ae_reenter(ae: &Arc<AsyncExecutorShared>, worker: Arc<WorkerTask>) {
    ae.workers_eq.push_back(worker, false);
}

/// An outstanding asynchronous operation created by [`AsyncExecutor`].
pub struct Operation {
    op_state: Mutex<Option<Arc<dyn OpState>>>,
    worker: Mutex<Option<Arc<WorkerTask>>>,
    active: AtomicBool,
    pooled_freed: AtomicBool,
}

impl Operation {
    fn new(op_state: Arc<dyn OpState>) -> Arc<Self> {
        Arc::new(Operation {
            op_state: Mutex::new(Some(op_state)),
            worker: Mutex::new(None),
            active: AtomicBool::new(true),
            pooled_freed: AtomicBool::new(false),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct AsyncExecutorShared {
    pool: Arc<ThreadPool>,
    completion_pool: Arc<ThreadPool>,
    workers_eq: Arc<ExecutionQueue>,
    completion_eq: Arc<ExecutionQueue>,
    outstanding_calls: AtomicUsize,
    free_workers: Mutex<Vec<Arc<WorkerTask>>>,
    disposed: AtomicBool,
}

/// The async executor itself. Wraps the shared state in an `Arc` so worker
/// tasks can hold a `Weak` back-reference without keeping it alive.
pub struct AsyncExecutor {
    shared: Arc<AsyncExecutorShared>,
}

impl AsyncExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let pool = ThreadPool::new(config.threads);
        let completion_pool = ThreadPool::new(config.threads);
        let workers_eq = ExecutionQueue::new();
        workers_eq.set_options(QueueOptions::KEEP_NONE);
        workers_eq.set_throttle_limit(config.threads);

        let completion_eq = ExecutionQueue::new();
        completion_eq.set_options(QueueOptions::KEEP_NONE);
        completion_eq.set_throttle_limit(config.threads);

        let shared = Arc::new(AsyncExecutorShared {
            pool,
            completion_pool,
            workers_eq,
            completion_eq,
            outstanding_calls: AtomicUsize::new(0),
            free_workers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        AsyncExecutor { shared }
    }

    pub fn max_concurrent_tasks(&self, config: &ExecutorConfig) -> usize {
        config.threads * config.max_tasks_multiplier.max(1)
    }

    /// `createOperation`.
    pub fn create_operation(&self, op_state: Arc<dyn OpState>) -> Arc<Operation> {
        self.shared.outstanding_calls.fetch_add(1, Ordering::SeqCst);
        Operation::new(op_state)
    }

    /// `asyncBegin`.
    pub fn async_begin(
        &self,
        operation: &Arc<Operation>,
        callback: OperationCallback,
    ) -> Result<(), CoreError> {
        let existing_worker = operation.worker.lock().unwrap().clone();
        if let Some(worker) = existing_worker {
            if worker.has_pending_call() {
                return Err(CoreError::InvariantViolated(
                    "asyncBegin called while a call is already pending on this operation",
                ));
            }
            return worker.request_new_async_call(callback);
        }

        let op_state = operation
            .op_state
            .lock()
            .unwrap()
            .clone()
            .ok_or(CoreError::InvariantViolated("operation has no op_state"))?;

        let worker = self.acquire_worker();
        worker.arm(op_state, callback);
        *operation.worker.lock().unwrap() = Some(Arc::clone(&worker));
        self.shared
            .workers_eq
            .push_back(worker as Arc<dyn Task>, false);
        Ok(())
    }

    fn acquire_worker(&self) -> Arc<WorkerTask> {
        if let Some(worker) = self.shared.free_workers.lock().unwrap().pop() {
            return worker;
        }
        WorkerTask::new(Arc::clone(&self.shared.pool), Arc::downgrade(&self.shared))
    }

    /// `releaseOperation`.
    pub fn release_operation(&self, operation: &Arc<Operation>) -> Result<(), CoreError> {
        let worker = operation.worker.lock().unwrap().take();
        if let Some(worker) = &worker {
            if worker.has_pending_call() {
                return Err(CoreError::InvariantViolated(
                    "releaseOperation called while a call is pending",
                ));
            }
            self.shared.free_workers.lock().unwrap().push(Arc::clone(worker));
        }
        *operation.op_state.lock().unwrap() = None;
        operation.active.store(false, Ordering::SeqCst);
        operation.pooled_freed.store(true, Ordering::SeqCst);
        self.shared.outstanding_calls.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// `requestCancel` on an in-flight operation.
    pub fn request_cancel(&self, operation: &Arc<Operation>) {
        if let Some(worker) = operation.worker.lock().unwrap().clone() {
            worker.request_cancel();
        }
    }

    /// `dispose`: asserts `outstanding_calls == 0` (a
    /// `FatalInvariantViolation` per spec.md §7 if violated — this is a
    /// programmer error, not a recoverable one).
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let outstanding = self.shared.outstanding_calls.load(Ordering::SeqCst);
        assert_eq!(
            outstanding, 0,
            "AsyncExecutor::dispose called with outstanding operations"
        );
        self.shared.workers_eq.dispose();
        // Completion tasks must not be cancelled, only flushed: cancelling
        // them would strand their worker tasks mid-chain.
        let _ = self.shared.completion_eq.flush(false, true, true, false);
        self.shared.completion_eq.dispose();
        self.shared.pool.shutdown();
        self.shared.completion_pool.shutdown();
    }

    pub fn outstanding_calls(&self) -> usize {
        self.shared.outstanding_calls.load(Ordering::SeqCst)
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        if !self.shared.disposed.load(Ordering::SeqCst) {
            tracing::warn!("AsyncExecutor dropped without calling dispose()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct NoopOp;
    impl OpState for NoopOp {
        fn execute(&self) -> Result<(), StoredFailure> {
            Ok(())
        }
    }

    #[test]
    fn callback_invoked_exactly_once_on_success() {
        let ae = AsyncExecutor::new(ExecutorConfig {
            threads: 2,
            max_tasks_multiplier: 8,
        });
        let op = ae.create_operation(Arc::new(NoopOp));
        let (tx, rx) = mpsc::channel();
        ae.async_begin(
            &op,
            Box::new(move |outcome| {
                let ok = matches!(outcome, CallOutcome::Ok);
                tx.send(ok).unwrap();
            }),
        )
        .unwrap();
        let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(ok);
        // give the termination call a chance to settle before release.
        std::thread::sleep(Duration::from_millis(50));
        ae.release_operation(&op).unwrap();
        ae.dispose();
    }

    #[test]
    fn cancel_before_execute_reports_aborted() {
        let ae = AsyncExecutor::new(ExecutorConfig {
            threads: 2,
            max_tasks_multiplier: 8,
        });
        let op = ae.create_operation(Arc::new(NoopOp));
        let (tx, rx) = mpsc::channel();
        ae.async_begin(
            &op,
            Box::new(move |outcome| {
                let aborted = matches!(outcome, CallOutcome::Err(CoreError::Aborted { .. }));
                tx.send(aborted).unwrap();
            }),
        )
        .unwrap();
        ae.request_cancel(&op);
        let aborted = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(aborted);
        std::thread::sleep(Duration::from_millis(50));
        ae.release_operation(&op).unwrap();
        ae.dispose();
    }
}
