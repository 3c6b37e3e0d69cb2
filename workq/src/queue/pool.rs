use crate::queue::{Builder, JobFn, JobQueue, QueueCore};
use crate::task::{JobId, QueueId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// State shared between the queue handle and its worker threads.
pub(super) struct PoolShared {
    pub(super) core: QueueCore,
    pub(super) cond: Condvar,

    // Read inside the wait loop while holding the jobs mutex, and flipped by
    // `stop` under the same mutex, so a worker cannot miss the shutdown
    // notification between its empty-check and its wait.
    pub(super) running: AtomicBool,
}

impl PoolShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// A queue draining its FIFO on dedicated worker threads.
///
/// Workers block on a condition variable paired with the jobs mutex while
/// the queue is empty, and otherwise pop-and-run jobs one at a time with the
/// mutex released around each invocation. With more than one worker, jobs
/// from the same queue run concurrently and may complete out of enqueue
/// order; FIFO completion is only guaranteed with a single worker.
///
/// [`ThreadPoolQueue::stop`] shuts the pool down: workers finish the job
/// they are on, every thread is joined, and whatever is left in the FIFO is
/// discarded without being invoked. Dropping the queue stops it.
pub struct ThreadPoolQueue {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPoolQueue {
    /// Pool with an auto-allocated queue id and `workers` threads.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        Builder::new().worker_threads(workers).build()
    }

    /// Pool with a caller-chosen queue id and `workers` threads.
    pub fn with_id(id: QueueId, workers: usize) -> std::io::Result<Self> {
        Builder::new().queue_id(id).worker_threads(workers).build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(super) fn from_builder(builder: &Builder) -> std::io::Result<Self> {
        let id = builder.queue_id.unwrap_or_else(QueueId::next);

        let pool = Self {
            shared: Arc::new(PoolShared {
                core: QueueCore::new(id),
                cond: Condvar::new(),
                running: AtomicBool::new(true),
            }),
            workers: Mutex::new(Vec::with_capacity(builder.worker_threads)),
        };

        for index in 0..builder.worker_threads {
            let mut thread_builder = thread::Builder::new().name((builder.thread_name)(id, index));
            if let Some(stack_size) = builder.thread_stack_size {
                thread_builder = thread_builder.stack_size(stack_size);
            }

            let shared = Arc::clone(&pool.shared);
            match thread_builder.spawn(move || worker_loop(&shared)) {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    // Roll back the workers spawned so far.
                    pool.stop();
                    return Err(e);
                }
            }
        }

        tracing::debug!(queue = %id, workers = builder.worker_threads, "thread pool started");
        Ok(pool)
    }

    /// Stops the pool: flips `running` under the jobs mutex, wakes every
    /// worker, joins them all, then discards any jobs still in the FIFO.
    ///
    /// Idempotent; a second call (including the one from `Drop`) returns
    /// immediately. Must not be called from one of the pool's own workers.
    pub fn stop(&self) {
        {
            let _slots = self.shared.core.slots.lock();
            if !self.shared.running.swap(false, Ordering::AcqRel) {
                return;
            }
            self.shared.cond.notify_all();
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(queue = %self.id(), "worker thread panicked");
            }
        }

        let dropped = self.shared.core.clear();
        if dropped > 0 {
            tracing::debug!(queue = %self.id(), dropped, "discarded pending jobs at shutdown");
        }
    }
}

impl JobQueue for ThreadPoolQueue {
    fn id(&self) -> QueueId {
        self.shared.core.id()
    }

    fn enqueue(&self, func: JobFn) -> JobId {
        let id = self.shared.core.push(func);

        // New-job hook: wake one idle worker.
        self.shared.cond.notify_one();
        id
    }

    fn cancel(&self, job_id: JobId) -> bool {
        self.shared.core.cancel(job_id)
    }

    fn is_empty(&self) -> bool {
        self.shared.core.is_empty()
    }

    fn len(&self) -> usize {
        self.shared.core.len()
    }

    fn run_next(&self) -> bool {
        self.shared.core.run_next()
    }
}

impl Drop for ThreadPoolQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ThreadPoolQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolQueue")
            .field("id", &self.id())
            .field("len", &self.len())
            .field("running", &self.shared.is_running())
            .finish()
    }
}

fn worker_loop(shared: &PoolShared) {
    while shared.is_running() {
        {
            // Wait until there's work to do (or shutdown).
            let mut slots = shared.core.slots.lock();
            while shared.is_running() && slots.jobs.is_empty() {
                shared.cond.wait(&mut slots);
            }
        }

        // Drain. Each run_next pops under the jobs mutex and releases it
        // before invoking the job.
        while shared.is_running() && shared.core.run_next() {}
    }
}
