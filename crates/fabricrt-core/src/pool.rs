//! A small, fixed-size thread pool for bounding synchronous work.
//!
//! Deliberately distinct from the tokio runtime: the async executor (§4.2)
//! needs to bound *blocking* task bodies by a fixed worker count, the same
//! way the original's dedicated thread pool does, independent of however
//! many tokio worker threads happen to be configured for IO.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of OS threads pulling from a shared MPMC-style job queue.
///
/// Dropping the pool does not join its workers; call [`ThreadPool::shutdown`]
/// for an orderly drain.
pub struct ThreadPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Builds a pool with `size` worker threads. `size` is clamped to at
    /// least 1.
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("fabricrt-pool-{index}"))
                    .spawn(move || {
                        loop {
                            let job = {
                                let guard = receiver.lock().unwrap();
                                guard.recv()
                            };
                            match job {
                                Ok(job) => job(),
                                Err(_) => break, // sender dropped: pool shutting down
                            }
                        }
                    })
                    .expect("failed to spawn pool worker thread"),
            );
        }
        Arc::new(ThreadPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueues `job` to run on the next free worker. Silently drops the job
    /// if the pool has already been shut down (mirrors `scheduleNothrow`
    /// semantics: the caller relies on `on_ready` firing, not on this call
    /// itself reporting failure).
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(Box::new(job));
        } else {
            tracing::warn!("dropped job submitted to a shut-down thread pool");
        }
    }

    /// Closes the job channel and joins every worker thread. Idempotent.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_submitted_jobs() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        }
        for _ in 0..16 {
            done_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}
