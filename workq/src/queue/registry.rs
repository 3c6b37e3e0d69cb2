use crate::queue::{JobFn, JobQueue};
use crate::task::{JobId, QueueId};
use dashmap::DashMap;
use std::sync::{Arc, LazyLock};

/// Process-wide mapping from [`QueueId`] to a live queue.
///
/// The registry exists so that a job can be enqueued or canceled knowing
/// nothing but a numeric id: [`enqueue`] routes by queue id, [`cancel`]
/// extracts the queue id from the high bits of a [`JobId`]. The task engine
/// goes through the global instance exclusively.
///
/// A strong reference to the resolved queue is cloned out and every map
/// guard dropped before the queue is called, so the registry's locks are
/// never held while user code (or a queue's own mutex) is in play. Lock
/// ordering is registry, then queue, then work node; never the reverse.
pub struct QueueRegistry {
    queues: DashMap<QueueId, Arc<dyn JobQueue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Inserts a queue by its id. A duplicate id overwrites the previous
    /// entry; callers own id uniqueness.
    pub fn register(&self, queue: Arc<dyn JobQueue>) {
        let id = queue.id();
        if self.queues.insert(id, queue).is_some() {
            tracing::debug!(queue = %id, "queue re-registered, previous entry replaced");
        } else {
            tracing::debug!(queue = %id, "queue registered");
        }
    }

    /// Removes the entry; does not stop the queue. `true` iff it existed.
    pub fn unregister(&self, id: QueueId) -> bool {
        let removed = self.queues.remove(&id).is_some();
        if removed {
            tracing::debug!(queue = %id, "queue unregistered");
        }
        removed
    }

    pub fn contains(&self, id: QueueId) -> bool {
        self.queues.contains_key(&id)
    }

    /// Routes a job to the named queue. Returns [`JobId::NONE`] if the id
    /// is unknown.
    pub fn enqueue(&self, queue_id: QueueId, func: JobFn) -> JobId {
        match self.resolve(queue_id) {
            Some(queue) => queue.enqueue(func),
            None => JobId::NONE,
        }
    }

    /// Cancels a pending job wherever it lives. `false` for [`JobId::NONE`],
    /// for an unknown queue, and for a sequence no longer in the FIFO.
    pub fn cancel(&self, job_id: JobId) -> bool {
        if job_id.is_none() {
            return false;
        }

        match self.resolve(job_id.queue_id()) {
            Some(queue) => queue.cancel(job_id),
            None => false,
        }
    }

    fn resolve(&self, id: QueueId) -> Option<Arc<dyn JobQueue>> {
        // Clone the strong ref out; the guard must not outlive this scope.
        self.queues.get(&id).map(|entry| Arc::clone(entry.value()))
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.queues.len())
            .finish()
    }
}

static GLOBAL: LazyLock<QueueRegistry> = LazyLock::new(QueueRegistry::new);

/// The registry used by the free functions below and by the task engine.
pub(crate) fn global() -> &'static QueueRegistry {
    &GLOBAL
}

/// Registers `queue` with the process-wide registry.
pub fn register_queue(queue: Arc<dyn JobQueue>) {
    global().register(queue);
}

/// Removes a queue from the process-wide registry. `true` iff it existed.
pub fn unregister_queue(id: QueueId) -> bool {
    global().unregister(id)
}

/// Enqueues `func` onto the queue registered as `queue_id`.
///
/// Returns the new job's id, or [`JobId::NONE`] if no such queue is
/// registered.
pub fn enqueue<F>(queue_id: QueueId, func: F) -> JobId
where
    F: FnOnce() + Send + 'static,
{
    global().enqueue(queue_id, Box::new(func))
}

/// Cancels a pending job by id. `true` iff a job was removed from its
/// queue's FIFO.
pub fn cancel(job_id: JobId) -> bool {
    global().cancel(job_id)
}
