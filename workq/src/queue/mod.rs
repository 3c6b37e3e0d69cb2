//! Named work queues.
//!
//! A queue is an ordered FIFO of jobs, each tagged with a [`JobId`] that
//! encodes the owning queue in its high 32 bits. The two flavors share one
//! FIFO engine ([`QueueCore`]) and differ only in how jobs get drained:
//! [`FifoQueue`] is pulled by its caller via [`JobQueue::run_next`], while
//! [`ThreadPoolQueue`](pool::ThreadPoolQueue) owns worker threads that block
//! on a condition variable.

use crate::task::{JobId, QueueId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

pub mod builder;
pub mod pool;
pub mod registry;

pub use builder::Builder;
pub use pool::ThreadPoolQueue;
pub use registry::{QueueRegistry, cancel, enqueue, register_queue, unregister_queue};

/// A queued unit of work.
pub type JobFn = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) func: JobFn,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

/// The queue surface the registry and the task engine program against.
///
/// Object-safe so heterogeneous queue flavors can live in one registry.
pub trait JobQueue: Send + Sync + 'static {
    fn id(&self) -> QueueId;

    /// Appends a job and returns its id. Never returns [`JobId::NONE`].
    ///
    /// The id is minted and the job appended under the queue's jobs mutex;
    /// the implementation's new-job hook (if any) fires after the lock is
    /// released.
    fn enqueue(&self, func: JobFn) -> JobId;

    /// Removes a pending job by id. `true` iff it was found.
    ///
    /// A job id whose high bits name a different queue is rejected. A job
    /// already popped by a worker is out of reach here: once it left the
    /// FIFO it will run.
    fn cancel(&self, job_id: JobId) -> bool;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Pops and runs the head job, if any. The jobs mutex is released
    /// before the job's function is invoked. `true` iff a job ran.
    fn run_next(&self) -> bool;
}

pub(crate) struct Slots {
    pub(crate) jobs: VecDeque<Job>,
    next_seq: u32,
}

/// Mutex-guarded FIFO engine shared by both queue flavors.
///
/// Sequence numbers start at 1 and are strictly increasing within a queue
/// (not necessarily contiguous: cancellation skips ids). On `u32` wrap the
/// value 0 is skipped so [`JobId::NONE`] stays reserved; a queue that ever
/// enqueues more than `u32::MAX - 1` jobs will reuse ids.
pub(crate) struct QueueCore {
    id: QueueId,
    pub(crate) slots: Mutex<Slots>,
}

impl QueueCore {
    pub(crate) fn new(id: QueueId) -> Self {
        Self {
            id,
            slots: Mutex::new(Slots {
                jobs: VecDeque::new(),
                next_seq: 1,
            }),
        }
    }

    pub(crate) fn id(&self) -> QueueId {
        self.id
    }

    pub(crate) fn push(&self, func: JobFn) -> JobId {
        let id = {
            let mut slots = self.slots.lock();

            let seq = slots.next_seq;
            slots.next_seq = match slots.next_seq.wrapping_add(1) {
                0 => 1,
                n => n,
            };

            let id = JobId::pack(self.id, seq);
            slots.jobs.push_back(Job { id, func });
            id
        };

        tracing::trace!(queue = %self.id, job = %id, "job enqueued");
        id
    }

    pub(crate) fn cancel(&self, job_id: JobId) -> bool {
        let mut slots = self.slots.lock();

        // Defensive against callers holding a stale queue reference.
        if job_id.queue_id() != self.id {
            return false;
        }

        let Some(pos) = slots.jobs.iter().position(|job| job.id == job_id) else {
            return false;
        };

        slots.jobs.remove(pos);
        drop(slots);

        tracing::trace!(queue = %self.id, job = %job_id, "job canceled");
        true
    }

    pub(crate) fn pop(&self) -> Option<Job> {
        let job = self.slots.lock().jobs.pop_front()?;
        debug_assert!(!job.id.is_none());
        Some(job)
    }

    pub(crate) fn run_next(&self) -> bool {
        match self.pop() {
            // The lock is already released; the job may run user code.
            Some(job) => {
                (job.func)();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.lock().jobs.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().jobs.len()
    }

    /// Discards every pending job without invoking it. Returns how many
    /// were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let dropped = slots.jobs.len();
        slots.jobs.clear();
        dropped
    }
}

impl fmt::Debug for QueueCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCore")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// A caller-driven queue: jobs accumulate until someone calls
/// [`JobQueue::run_next`].
#[derive(Debug)]
pub struct FifoQueue {
    core: QueueCore,
}

impl FifoQueue {
    /// Creates a queue with an id from the process-global counter.
    pub fn new() -> Self {
        Self::with_id(QueueId::next())
    }

    pub fn with_id(id: QueueId) -> Self {
        Self {
            core: QueueCore::new(id),
        }
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl FifoQueue {
    /// Pops the head job without running it, standing in for a worker that
    /// dequeued but has not yet invoked.
    pub(crate) fn pop_job(&self) -> Option<Job> {
        self.core.pop()
    }
}

impl JobQueue for FifoQueue {
    fn id(&self) -> QueueId {
        self.core.id()
    }

    fn enqueue(&self, func: JobFn) -> JobId {
        self.core.push(func)
    }

    fn cancel(&self, job_id: JobId) -> bool {
        self.core.cancel(job_id)
    }

    fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    fn len(&self) -> usize {
        self.core.len()
    }

    fn run_next(&self) -> bool {
        self.core.run_next()
    }
}
