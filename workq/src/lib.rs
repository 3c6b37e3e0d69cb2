//! Task runtime built on named, process-registered work queues.
//!
//! Three abstractions stack on top of each other:
//!
//! - **Queues** ([`FifoQueue`], [`ThreadPoolQueue`]) hold jobs in FIFO
//!   order, tagged with [`JobId`]s that encode the owning queue. A queue is
//!   made reachable by id through the process-wide registry
//!   ([`register_queue`]); free-function [`enqueue`] / [`cancel`] route
//!   through it.
//! - **Tasks** ([`Task`], [`create_task`]) wrap a computation scheduled
//!   onto a queue, expose a shared blocking future for its result, support
//!   cancellation while the job is still pending, and chain continuations
//!   with [`Task::then`].
//! - **Combinators** ([`when_any`], [`when_all`], `a | b`, `a & b`) fan a
//!   collection of tasks into one task resolving with the completed
//!   inputs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use workq::{QueueId, ThreadPoolQueue, create_task, register_queue};
//!
//! let pool = ThreadPoolQueue::with_id(QueueId::new(444), 4)?;
//! register_queue(Arc::new(pool));
//!
//! let doubled = create_task(QueueId::new(444), || 21).then(|x| 2 * x);
//! assert_eq!(doubled.get().unwrap(), 42);
//! # std::io::Result::Ok(())
//! ```

pub mod combinator;
pub mod machine;
pub mod queue;
pub mod task;

#[cfg(test)]
pub(crate) mod test_utils;

pub use combinator::{when_all, when_any};
pub use machine::{EffectScope, StateMachine};
pub use queue::{
    Builder, FifoQueue, JobFn, JobQueue, QueueRegistry, ThreadPoolQueue, cancel, enqueue,
    register_queue, unregister_queue,
};
pub use task::{
    HandlerToken, JobId, QueueId, SharedFuture, Task, TaskError, TaskResult, create_task,
};
