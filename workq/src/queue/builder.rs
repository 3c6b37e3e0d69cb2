use crate::queue::ThreadPoolQueue;
use crate::task::QueueId;
use std::fmt;
use std::io;
use std::sync::Arc;

pub(super) type ThreadNameFn = Arc<dyn Fn(QueueId, usize) -> String + Send + Sync + 'static>;

fn default_thread_name_fn() -> ThreadNameFn {
    Arc::new(move |queue_id, index| format!("workq-{queue_id}-{index}"))
}

/// Configures and builds a [`ThreadPoolQueue`].
///
/// ```no_run
/// use workq::{QueueId, ThreadPoolQueue};
///
/// let pool = ThreadPoolQueue::builder()
///     .queue_id(QueueId::new(444))
///     .worker_threads(4)
///     .build()?;
/// # std::io::Result::Ok(())
/// ```
pub struct Builder {
    /// Queue id to register under; allocated from the process-global
    /// counter when unset.
    pub(super) queue_id: Option<QueueId>,

    /// The number of worker threads. Defaults to 1 worker per CPU core.
    pub(super) worker_threads: usize,

    /// Name fn for threads spawned by the pool.
    pub(super) thread_name: ThreadNameFn,

    /// Stack size for threads spawned by the pool.
    pub(super) thread_stack_size: Option<usize>,
}

impl Builder {
    pub(crate) fn new() -> Self {
        Self {
            queue_id: None,
            worker_threads: std::thread::available_parallelism().map_or(1, usize::from),
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    pub fn queue_id(&mut self, id: QueueId) -> &mut Self {
        self.queue_id = Some(id);
        self
    }

    /// # Panics
    ///
    /// Panics if `val` is 0.
    pub fn worker_threads(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = val;
        self
    }

    /// Sets a fixed name for threads spawned by the pool.
    ///
    /// The default name is `workq-{queue_id}-{index}`.
    pub fn thread_name(&mut self, val: impl Into<String>) -> &mut Self {
        let val = val.into();
        self.thread_name = Arc::new(move |_, _| val.clone());
        self
    }

    /// Sets a function used to name threads spawned by the pool. The
    /// function receives the queue id and the worker index.
    pub fn thread_name_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(QueueId, usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = Arc::new(f);
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater if the platform specifies a
    /// minimum.
    pub fn thread_stack_size(&mut self, val: usize) -> &mut Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Spawns the workers and returns the ready pool.
    pub fn build(&mut self) -> io::Result<ThreadPoolQueue> {
        ThreadPoolQueue::from_builder(self)
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("queue_id", &self.queue_id)
            .field("worker_threads", &self.worker_threads)
            .field("thread_stack_size", &self.thread_stack_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_builder_defaults() {
        let b = Builder::new();
        assert!(b.queue_id.is_none());
        assert!(b.worker_threads >= 1);
        assert!(b.thread_stack_size.is_none());
    }

    #[test]
    #[should_panic(expected = "worker threads cannot be set to 0")]
    fn test_zero_workers_rejected() {
        Builder::new().worker_threads(0);
    }

    #[test]
    fn test_custom_thread_name_fn() {
        let pool = ThreadPoolQueue::builder()
            .worker_threads(1)
            .thread_name_fn(|queue_id, index| format!("q{queue_id}w{index}"))
            .build()
            .unwrap();

        let (tx, rx) = mpsc::channel();
        pool.enqueue(Box::new(move || {
            tx.send(std::thread::current().name().map(str::to_owned))
                .unwrap();
        }));

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(name, format!("q{}w0", pool.id()));
    }
}
