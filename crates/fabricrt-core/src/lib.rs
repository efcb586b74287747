//! Execution queue and async executor primitives.
//!
//! `queue` implements the cooperative Execution Queue (Pending/Executing/
//! Ready sub-queues, throttling, continuations). `executor` builds an
//! asynchronous-operation façade on top of two queues and a thread pool.
//! `pool` is the dedicated thread pool both rely on. `context` and `error`
//! are the cross-cutting cancellation and error types shared by every crate
//! in this workspace.

pub mod context;
pub mod error;
pub mod executor;
pub mod pool;
pub mod queue;
pub mod task;

pub use context::{CallContext, CancellationToken};
pub use error::CoreError;
pub use executor::{AsyncExecutor, ExecutorConfig, OpState, Operation};
pub use queue::{ExecutionQueue, QueueOptions, Task};
