//! Execution Queue (EQ): a cooperative scheduler with Pending/Executing/Ready
//! sub-queues, throttling, continuations, and a notification sink.
//!
//! This is a direct translation of spec.md §4.1. The queue is intentionally
//! synchronous/blocking (a `Mutex` + `Condvar`, not `tokio::sync`): callers
//! that want async suspension build it on top by running `pop`/`wait` on a
//! blocking thread, the same way the async executor in this crate does for
//! its worker pool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{CoreError, StoredFailure};

/// A unit of scheduled work. Implementations are the "executor tasks" built
/// by [`crate::executor::AsyncExecutor`] as well as any other caller-defined
/// work the queue should drive.
///
/// `schedule` must never panic ("scheduleNothrow" in spec.md §4.1): any
/// failure in starting the task should be recorded via [`Task::set_failure`]
/// and `on_ready` still invoked exactly once.
pub trait Task: Send + Sync {
    /// Begin executing the task body, invoking `on_ready` exactly once when
    /// the task reaches a terminal state (success, failure, or cancellation).
    fn schedule(self: Arc<Self>, on_ready: ReadyCallback);

    /// Fetch this task's continuation task, if any. Returning a task that is
    /// pointer-identical to `self` means "re-queue me" (spec.md §3, §4.1).
    fn continuation(&self) -> Result<Option<Arc<dyn Task>>, StoredFailure> {
        Ok(None)
    }

    fn take_failure(&self) -> Option<StoredFailure> {
        None
    }

    fn set_failure(&self, _err: StoredFailure) {}

    fn is_failed(&self) -> bool {
        false
    }

    /// Request cooperative cancellation. The task is not required to honor
    /// this immediately; it is a request, never a terminal state (spec.md §3).
    fn request_cancel(&self) {}

    fn mark_completed(&self) {}

    /// Type-erased downcast hook, used by the async executor to recycle its
    /// own worker task implementation out of generic `Arc<dyn Task>` values.
    fn as_any(&self) -> &dyn std::any::Any;
}

pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Opaque identity for a queued task, derived from the task's `Arc` address.
/// Mirrors the C++ original's pointer-identity semantics for the
/// task→entry uniqueness map (spec.md §3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskKey(usize);

fn key_of(task: &Arc<dyn Task>) -> TaskKey {
    TaskKey(Arc::as_ptr(task) as *const () as usize)
}

/// Which sub-queue a task currently occupies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SubQueue {
    None,
    Pending,
    Executing,
    Ready,
}

struct Entry {
    task: Arc<dyn Task>,
    owner: SubQueue,
}

/// Which outcomes are retained in Ready after a task completes.
#[derive(Clone, Copy, Debug)]
pub struct QueueOptions {
    pub keep_failed: bool,
    pub keep_successful: bool,
    pub keep_canceled: bool,
}

impl QueueOptions {
    pub const KEEP_ALL: Self = QueueOptions {
        keep_failed: true,
        keep_successful: true,
        keep_canceled: true,
    };
    pub const KEEP_NONE: Self = QueueOptions {
        keep_failed: false,
        keep_successful: false,
        keep_canceled: false,
    };
    pub const KEEP_FAILED: Self = QueueOptions {
        keep_failed: true,
        keep_successful: false,
        keep_canceled: false,
    };
    pub const KEEP_SUCCESSFUL: Self = QueueOptions {
        keep_failed: false,
        keep_successful: true,
        keep_canceled: false,
    };
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions::KEEP_ALL
    }
}

/// Events delivered to a [`NotifySink`], dispatched outside the queue lock
/// (spec.md §4.1 "Notifications").
#[derive(Clone)]
pub enum NotifyEvent {
    TaskReady(Arc<dyn Task>),
    TaskDiscarded(Arc<dyn Task>),
    AllTasksCompleted,
}

/// Receives queue lifecycle events and may cap concurrency via
/// `max_ready_or_executing`.
///
/// Per spec.md §9 Open Questions, a return of `0` from
/// `max_ready_or_executing` is treated as *unbounded*, not zero — the
/// upstream implementation's behavior, preserved here rather than silently
/// "fixed" (see DESIGN.md).
pub trait NotifySink: Send + Sync {
    fn notify(&self, event: NotifyEvent);

    fn max_ready_or_executing(&self) -> usize {
        0
    }
}

struct QueueInner {
    pending: VecDeque<TaskKey>,
    executing: HashSet<TaskKey>,
    ready: VecDeque<TaskKey>,
    entries: HashMap<TaskKey, Entry>,
    disposed: bool,
}

impl QueueInner {
    fn new() -> Self {
        QueueInner {
            pending: VecDeque::new(),
            executing: HashSet::new(),
            ready: VecDeque::new(),
            entries: HashMap::new(),
            disposed: false,
        }
    }

    fn is_quiescent(&self) -> bool {
        self.pending.is_empty() && self.executing.is_empty()
    }
}

/// The Execution Queue itself. See module docs and spec.md §4.1.
pub struct ExecutionQueue {
    inner: Mutex<QueueInner>,
    cvar: Condvar,
    /// Acquired *before* `inner` when dispatching notifications, per the lock
    /// ordering rule in spec.md §5 ("events-ordering mutex before queue
    /// mutex, never inverted").
    events_lock: Mutex<()>,
    sink: Mutex<Option<Arc<dyn NotifySink>>>,
    options: Mutex<QueueOptions>,
    max_executing: AtomicUsize,
}

impl ExecutionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(ExecutionQueue {
            inner: Mutex::new(QueueInner::new()),
            cvar: Condvar::new(),
            events_lock: Mutex::new(()),
            sink: Mutex::new(None),
            options: Mutex::new(QueueOptions::default()),
            max_executing: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn set_options(&self, options: QueueOptions) {
        *self.options.lock().unwrap() = options;
    }

    pub fn set_throttle_limit(self: &Arc<Self>, max_executing: usize) {
        self.max_executing
            .store(max_executing.max(1), Ordering::SeqCst);
        self.pad();
    }

    pub fn set_notify_sink(self: &Arc<Self>, sink: Option<Arc<dyn NotifySink>>) {
        *self.sink.lock().unwrap() = sink;
    }

    fn max_ready_or_executing(&self) -> usize {
        match self.sink.lock().unwrap().as_ref() {
            Some(sink) => {
                let bound = sink.max_ready_or_executing();
                if bound == 0 { usize::MAX } else { bound }
            }
            None => usize::MAX,
        }
    }

    fn emit(&self, event: NotifyEvent) {
        let _events_guard = self.events_lock.lock().unwrap();
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.notify(event);
        }
    }

    /// Places `task` into Pending (or Ready if `dont_schedule`). Re-pushing a
    /// task that is currently in Ready returns it to Pending; any other
    /// existing membership is left untouched structurally but still pads.
    pub fn push_back(self: &Arc<Self>, task: Arc<dyn Task>, dont_schedule: bool) {
        self.push(task, dont_schedule, false)
    }

    pub fn push_front(self: &Arc<Self>, task: Arc<dyn Task>, dont_schedule: bool) {
        self.push(task, dont_schedule, true)
    }

    fn push(self: &Arc<Self>, task: Arc<dyn Task>, dont_schedule: bool, front: bool) {
        let key = key_of(&task);
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.disposed {
                return;
            }
            if let Some(entry) = guard.entries.get(&key) {
                if entry.owner == SubQueue::Ready {
                    // Re-queue: remove from Ready, fall through to insert into Pending.
                    guard.ready.retain(|k| *k != key);
                } else {
                    // Already Pending/Executing: nothing structural to do.
                    drop(guard);
                    self.pad();
                    return;
                }
            }
            let owner = if dont_schedule {
                SubQueue::Ready
            } else {
                SubQueue::Pending
            };
            guard.entries.insert(key, Entry { task, owner });
            if dont_schedule {
                guard.ready.push_back(key);
            } else if front {
                guard.pending.push_front(key);
            } else {
                guard.pending.push_back(key);
            }
        }
        self.pad();
    }

    /// Drives Pending → Executing up to the throttle bound, invoking
    /// `Task::schedule` for each task promoted.
    fn pad(self: &Arc<Self>) {
        loop {
            let (task, key) = {
                let mut guard = self.inner.lock().unwrap();
                if guard.disposed {
                    return;
                }
                let max_executing = self.max_executing.load(Ordering::SeqCst);
                let max_ready_or_executing = self.max_ready_or_executing();
                let occupancy = guard.ready.len() + guard.executing.len();
                if guard.pending.is_empty()
                    || guard.executing.len() >= max_executing
                    || occupancy >= max_ready_or_executing
                {
                    return;
                }
                let key = guard.pending.pop_front().unwrap();
                guard.executing.insert(key);
                let entry = guard.entries.get_mut(&key).expect("entry must exist");
                entry.owner = SubQueue::Executing;
                (entry.task.clone(), key)
            };
            let queue = Arc::clone(self);
            let on_ready: ReadyCallback = Box::new(move || {
                queue.on_ready(key);
            });
            task.schedule(on_ready);
        }
    }

    /// Invoked when a task signals it has reached a terminal state.
    fn on_ready(self: &Arc<Self>, key: TaskKey) {
        let task = {
            let guard = self.inner.lock().unwrap();
            match guard.entries.get(&key) {
                Some(entry) => entry.task.clone(),
                None => return, // disposed/removed concurrently
            }
        };

        // Step 1: continuation handling, outside the queue lock.
        match task.continuation() {
            Ok(Some(cont)) => {
                if key_of(&cont) == key {
                    // Re-queue: move back to Pending.
                    let mut guard = self.inner.lock().unwrap();
                    guard.executing.remove(&key);
                    if let Some(entry) = guard.entries.get_mut(&key) {
                        entry.owner = SubQueue::Pending;
                    }
                    guard.pending.push_back(key);
                    drop(guard);
                    self.pad();
                    return;
                } else {
                    let mut guard = self.inner.lock().unwrap();
                    guard.executing.remove(&key);
                    guard.entries.remove(&key);
                    drop(guard);
                    self.push_front(cont, false);
                }
            }
            Ok(None) => {}
            Err(err) => task.set_failure(err),
        }

        // Step 2/3: retire the original task.
        let mut guard = self.inner.lock().unwrap();
        guard.executing.remove(&key);
        task.mark_completed();
        let failed = task.is_failed();
        let options = *self.options.lock().unwrap();
        let retain = if failed {
            options.keep_failed
        } else {
            options.keep_successful
        };
        if retain {
            if let Some(entry) = guard.entries.get_mut(&key) {
                entry.owner = SubQueue::Ready;
            }
            guard.ready.push_back(key);
            let quiescent_now = guard.is_quiescent();
            drop(guard);
            self.cvar.notify_all();
            self.emit(NotifyEvent::TaskReady(task));
            if quiescent_now {
                self.emit(NotifyEvent::AllTasksCompleted);
            }
        } else {
            guard.entries.remove(&key);
            let quiescent_now = guard.is_quiescent();
            drop(guard);
            self.cvar.notify_all();
            self.emit(NotifyEvent::TaskDiscarded(task));
            if quiescent_now {
                self.emit(NotifyEvent::AllTasksCompleted);
            }
        }

        self.pad();
    }

    /// Pops the head of Ready. If `wait`, blocks until Ready is non-empty or
    /// the queue has drained (Pending and Executing both empty).
    pub fn pop(self: &Arc<Self>, wait: bool) -> Option<Arc<dyn Task>> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(key) = guard.ready.pop_front() {
                let entry = guard.entries.remove(&key).expect("entry must exist");
                return Some(entry.task);
            }
            if !wait || guard.is_quiescent() {
                return None;
            }
            guard = self.cvar.wait(guard).unwrap();
        }
    }

    /// Like [`ExecutionQueue::pop`] but does not remove the task from Ready.
    pub fn top(self: &Arc<Self>, wait: bool) -> Option<Arc<dyn Task>> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(key) = guard.ready.front() {
                return guard.entries.get(key).map(|e| e.task.clone());
            }
            if !wait || guard.is_quiescent() {
                return None;
            }
            guard = self.cvar.wait(guard).unwrap();
        }
    }

    /// Blocks until `task` leaves the queue. If `cancel`, requests
    /// cancellation first (and if the task is still Pending, unlinks it
    /// immediately rather than waiting for a scheduling slot).
    pub fn wait(self: &Arc<Self>, task: &Arc<dyn Task>, cancel: bool) {
        let key = key_of(task);
        if cancel {
            let mut guard = self.inner.lock().unwrap();
            if let Some(entry) = guard.entries.get(&key) {
                if entry.owner == SubQueue::Pending {
                    guard.pending.retain(|k| *k != key);
                    guard.entries.remove(&key);
                    return;
                }
            }
            drop(guard);
            task.request_cancel();
        }
        let mut guard = self.inner.lock().unwrap();
        loop {
            match guard.entries.get(&key).map(|e| e.owner) {
                None => return,
                Some(SubQueue::Ready) => {
                    guard.entries.remove(&key);
                    guard.ready.retain(|k| *k != key);
                    return;
                }
                _ => {
                    guard = self.cvar.wait(guard).unwrap();
                }
            }
        }
    }

    /// Moves `task` to the head of Pending if it is currently Pending.
    /// Returns whether it moved.
    pub fn prioritize(&self, task: &Arc<dyn Task>) -> bool {
        let key = key_of(task);
        let mut guard = self.inner.lock().unwrap();
        if guard.entries.get(&key).map(|e| e.owner) != Some(SubQueue::Pending) {
            return false;
        }
        guard.pending.retain(|k| *k != key);
        guard.pending.push_front(key);
        true
    }

    /// If Pending, unlinks (optionally into Ready). If Executing, requests
    /// cancel and returns `false` (cannot truly cancel in-flight work).
    pub fn cancel(self: &Arc<Self>, task: &Arc<dyn Task>, wait: bool) -> bool {
        if wait {
            self.wait(task, true);
            return true;
        }
        let key = key_of(task);
        let mut guard = self.inner.lock().unwrap();
        match guard.entries.get(&key).map(|e| e.owner) {
            Some(SubQueue::Pending) => {
                guard.pending.retain(|k| *k != key);
                let keep_canceled = self.options.lock().unwrap().keep_canceled;
                if keep_canceled {
                    if let Some(entry) = guard.entries.get_mut(&key) {
                        entry.owner = SubQueue::Ready;
                    }
                    guard.ready.push_back(key);
                } else {
                    guard.entries.remove(&key);
                }
                true
            }
            Some(SubQueue::Executing) => {
                drop(guard);
                task.request_cancel();
                false
            }
            _ => true,
        }
    }

    /// Requests cancellation on all Executing tasks, and discards Pending
    /// and Ready entirely.
    pub fn cancel_all(self: &Arc<Self>, wait: bool) {
        let executing_tasks: Vec<Arc<dyn Task>> = {
            let mut guard = self.inner.lock().unwrap();
            let pending: Vec<TaskKey> = guard.pending.drain(..).collect();
            for key in pending {
                guard.entries.remove(&key);
            }
            let ready: Vec<TaskKey> = guard.ready.drain(..).collect();
            for key in ready {
                guard.entries.remove(&key);
            }
            guard
                .executing
                .iter()
                .filter_map(|key| guard.entries.get(key).map(|e| e.task.clone()))
                .collect()
        };
        for task in executing_tasks {
            task.request_cancel();
        }
        if wait {
            let mut guard = self.inner.lock().unwrap();
            while !guard.is_quiescent() {
                guard = self.cvar.wait(guard).unwrap();
            }
        }
    }

    /// Drives the queue to quiescence under the given policy. If
    /// `nothrow_if_failed` is false, re-raises the first stored failure
    /// found in Ready after draining.
    pub fn flush(
        self: &Arc<Self>,
        discard_pending: bool,
        nothrow_if_failed: bool,
        discard_ready: bool,
        cancel_executing: bool,
    ) -> Result<(), CoreError> {
        if discard_pending {
            let mut guard = self.inner.lock().unwrap();
            let pending: Vec<TaskKey> = guard.pending.drain(..).collect();
            for key in pending {
                guard.entries.remove(&key);
            }
        }
        if cancel_executing {
            let executing_tasks: Vec<Arc<dyn Task>> = {
                let guard = self.inner.lock().unwrap();
                guard
                    .executing
                    .iter()
                    .filter_map(|key| guard.entries.get(key).map(|e| e.task.clone()))
                    .collect()
            };
            for task in executing_tasks {
                task.request_cancel();
            }
        }
        loop {
            let mut guard = self.inner.lock().unwrap();
            while !guard.is_quiescent() {
                guard = self.cvar.wait(guard).unwrap();
            }
            break;
        }

        let mut first_failure: Option<StoredFailure> = None;
        if discard_ready {
            let mut guard = self.inner.lock().unwrap();
            let ready: Vec<TaskKey> = guard.ready.drain(..).collect();
            for key in ready {
                if let Some(entry) = guard.entries.remove(&key) {
                    if first_failure.is_none() {
                        first_failure = entry.task.take_failure();
                    }
                }
            }
        } else if !nothrow_if_failed {
            let guard = self.inner.lock().unwrap();
            for key in guard.ready.iter() {
                if let Some(entry) = guard.entries.get(key) {
                    if entry.task.is_failed() {
                        first_failure = entry.task.take_failure();
                        break;
                    }
                }
            }
        }

        if !nothrow_if_failed {
            if let Some(failure) = first_failure {
                return Err(CoreError::TaskFailed(failure));
            }
        }
        Ok(())
    }

    /// Iterates the entries of a named sub-queue under the queue lock.
    pub fn scan_queue(&self, which: SubQueue, mut cb: impl FnMut(&Arc<dyn Task>)) {
        let guard = self.inner.lock().unwrap();
        let keys: &VecDeque<TaskKey> = match which {
            SubQueue::Pending => &guard.pending,
            SubQueue::Ready => &guard.ready,
            _ => return,
        };
        for key in keys {
            if let Some(entry) = guard.entries.get(key) {
                cb(&entry.task);
            }
        }
    }

    pub fn len_ready(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    pub fn len_pending(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn len_executing(&self) -> usize {
        self.inner.lock().unwrap().executing.len()
    }

    /// Flushes with the most aggressive policy, waits to empty, and marks
    /// the queue disposed. Idempotent.
    pub fn dispose(self: &Arc<Self>) {
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.disposed {
                return;
            }
            guard.disposed = true;
        }
        let _ = self.flush(true, true, true, true);
        self.set_notify_sink(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct NoopTask {
        continuations_left: AtomicUsize,
    }

    impl NoopTask {
        fn new(continuations: usize) -> Arc<Self> {
            Arc::new(NoopTask {
                continuations_left: AtomicUsize::new(continuations),
            })
        }
    }

    impl Task for NoopTask {
        fn schedule(self: Arc<Self>, on_ready: ReadyCallback) {
            std::thread::spawn(move || {
                on_ready();
            });
        }

        fn continuation(&self) -> Result<Option<Arc<dyn Task>>, StoredFailure> {
            Ok(None)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct SelfRequeueTask {
        remaining: AtomicUsize,
        self_ref: Mutex<Option<std::sync::Weak<SelfRequeueTask>>>,
        runs: AtomicUsize,
    }

    impl SelfRequeueTask {
        fn new(extra_runs: usize) -> Arc<Self> {
            let task = Arc::new(SelfRequeueTask {
                remaining: AtomicUsize::new(extra_runs),
                self_ref: Mutex::new(None),
                runs: AtomicUsize::new(0),
            });
            *task.self_ref.lock().unwrap() = Some(Arc::downgrade(&task));
            task
        }
    }

    impl Task for SelfRequeueTask {
        fn schedule(self: Arc<Self>, on_ready: ReadyCallback) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::thread::spawn(move || {
                on_ready();
            });
        }

        fn continuation(&self) -> Result<Option<Arc<dyn Task>>, StoredFailure> {
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return Ok(None);
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            let me = self
                .self_ref
                .lock()
                .unwrap()
                .as_ref()
                .and_then(std::sync::Weak::upgrade)
                .unwrap();
            Ok(Some(me as Arc<dyn Task>))
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct CountingSink {
        ready: Mutex<usize>,
        discarded: Mutex<usize>,
        all_completed: Mutex<usize>,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(CountingSink {
                ready: Mutex::new(0),
                discarded: Mutex::new(0),
                all_completed: Mutex::new(0),
            })
        }
    }

    impl NotifySink for CountingSink {
        fn notify(&self, event: NotifyEvent) {
            match event {
                NotifyEvent::TaskReady(_) => *self.ready.lock().unwrap() += 1,
                NotifyEvent::TaskDiscarded(_) => *self.discarded.lock().unwrap() += 1,
                NotifyEvent::AllTasksCompleted => *self.all_completed.lock().unwrap() += 1,
            }
        }
    }

    #[test]
    fn throttle_bounds_executing_and_fires_all_completed_once() {
        let eq = ExecutionQueue::new();
        eq.set_options(QueueOptions::KEEP_ALL);
        eq.set_throttle_limit(2);
        let sink = CountingSink::new();
        eq.set_notify_sink(Some(sink.clone()));

        for _ in 0..5 {
            eq.push_back(NoopTask::new(0), false);
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while eq.len_ready() < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(eq.len_ready(), 5);
        assert_eq!(eq.len_pending(), 0);
        assert_eq!(eq.len_executing(), 0);
        assert_eq!(*sink.all_completed.lock().unwrap(), 1);
    }

    #[test]
    fn self_returning_continuation_runs_twice() {
        let eq = ExecutionQueue::new();
        eq.set_options(QueueOptions::KEEP_ALL);
        eq.set_throttle_limit(4);
        let task = SelfRequeueTask::new(1);
        eq.push_back(task.clone(), false);

        let popped = eq.pop(true).expect("task should reach Ready");
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
        let expected: Arc<dyn Task> = task.clone();
        assert!(Arc::ptr_eq(&popped, &expected));
    }

    #[test]
    fn pop_without_wait_returns_none_when_ready_empty() {
        let eq = ExecutionQueue::new();
        assert!(eq.pop(false).is_none());
    }
}
