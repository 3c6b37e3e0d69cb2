use crate::task::promise::{SharedFuture, TaskResult};
use crate::task::work::{HandlerToken, Schedulable, WorkNode};
use crate::task::{JobId, QueueId};
use std::fmt;
use std::sync::Arc;

/// A handle to a computation scheduled on a named queue, and to its
/// eventual result.
///
/// The handle is a thin value over a shared work node: clones are cheap and
/// all observe the same task. Dropping every handle does not cancel the
/// task; the job closure keeps the node alive until it has run (or been
/// canceled).
///
/// `T: Clone` because the underlying future is shared: every waiter gets an
/// owned copy of the value.
///
/// ```no_run
/// use std::sync::Arc;
/// use workq::{QueueId, Task, ThreadPoolQueue, register_queue};
///
/// let pool = ThreadPoolQueue::with_id(QueueId::new(444), 4)?;
/// register_queue(Arc::new(pool));
///
/// let task = Task::new(QueueId::new(444), || 2 + 2);
/// assert_eq!(task.get().unwrap(), 4);
/// # std::io::Result::Ok(())
/// ```
pub struct Task<T> {
    work: Arc<WorkNode<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            work: Arc::clone(&self.work),
        }
    }
}

impl<T> Task<T>
where
    T: Clone + Send + 'static,
{
    /// Creates the task and immediately schedules it onto `queue_id`.
    pub fn new<F>(queue_id: QueueId, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let work = WorkNode::new(queue_id, Box::new(move || Ok(f())));
        work.schedule();
        Self { work }
    }

    /// Blocks until the task resolves and returns its outcome.
    ///
    /// A canceled task yields `Err(TaskError::Canceled)`; a task whose
    /// function panicked yields `Err(TaskError::Panicked)`.
    pub fn get(&self) -> TaskResult<T> {
        self.work.future().get()
    }

    /// Non-blocking probe; `None` while the task is still in flight.
    pub fn try_get(&self) -> Option<TaskResult<T>> {
        self.work.future().try_get()
    }

    /// Blocks until the task resolves, without extracting the value.
    pub fn wait(&self) {
        self.work.future().wait()
    }

    /// The shared future, for composition outside the task API.
    pub fn future(&self) -> SharedFuture<T> {
        self.work.future()
    }

    /// Requests cancellation. `true` iff the task ended up `Canceled`.
    ///
    /// Only a task still `Waiting` or `Scheduled` can be canceled; a
    /// running or completed task is left alone and `false` is returned. A
    /// started job is never preempted.
    pub fn cancel(&self) -> bool {
        Schedulable::cancel(&*self.work)
    }

    pub fn is_canceled(&self) -> bool {
        self.work.is_canceled()
    }

    /// The queue this task targets (continuations inherit it by default).
    pub fn queue_id(&self) -> QueueId {
        Schedulable::queue_id(&*self.work)
    }

    /// The id of the enqueued job: [`JobId::NONE`] before scheduling
    /// reached the queue and after cancellation.
    pub fn job_id(&self) -> JobId {
        Schedulable::job_id(&*self.work)
    }

    /// Registers `handler` to run once when the task completes; it receives
    /// a clone of this handle. If the task has already completed, the
    /// handler runs synchronously on the calling thread and
    /// [`HandlerToken::FIRED`] is returned.
    pub fn add_completion_handler<F>(&self, handler: F) -> HandlerToken
    where
        F: FnOnce(Task<T>) + Send + 'static,
    {
        let this = self.clone();
        self.work.add_completion_handler(Box::new(move || handler(this)))
    }

    /// Removes a registered handler. `false` if it already fired (or the
    /// token is [`HandlerToken::FIRED`]). Racing a completion is fair game:
    /// either the removal wins and the handler never runs, or the
    /// completion wins and this returns `false`.
    pub fn remove_completion_handler(&self, token: HandlerToken) -> bool {
        self.work.remove_completion_handler(token)
    }

    /// Chains `f` to run with this task's value, on the same queue.
    pub fn then<U, F>(&self, f: F) -> Task<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_on(self.queue_id(), f)
    }

    /// Chains `f` to run with this task's value, on `queue_id`.
    ///
    /// The continuation is scheduled strictly after this task completes, so
    /// its closure finds the future already resolved. Attaching to an
    /// already-completed task schedules immediately; attaching to a
    /// canceled task yields an already-canceled continuation. An error
    /// outcome (cancellation, panic) propagates: the continuation fails
    /// with the antecedent's error and `f` is not called.
    pub fn then_on<U, F>(&self, queue_id: QueueId, f: F) -> Task<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let future = self.work.future();
        let work: Arc<WorkNode<U>> = WorkNode::new(
            queue_id,
            Box::new(move || {
                let value = future.get()?;
                Ok(f(value))
            }),
        );

        if !self.work.add_next_work(Arc::clone(&work) as Arc<dyn Schedulable>) {
            // Antecedent already canceled; resolve the continuation too
            // instead of leaving it waiting forever.
            Schedulable::cancel(&*work);
        }

        Task { work }
    }
}

/// Creates a [`Task`] running `f` on the queue registered as `queue_id`.
///
/// Free-function spelling of [`Task::new`].
pub fn create_task<T, F>(queue_id: QueueId, f: F) -> Task<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Task::new(queue_id, f)
}

impl<T> fmt::Debug for Task<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("queue_id", &self.queue_id())
            .field("job_id", &self.job_id())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
