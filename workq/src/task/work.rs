use crate::machine::{EffectScope, StateMachine};
use crate::queue;
use crate::task::error::panic_message;
use crate::task::promise::{Promise, SharedFuture, TaskResult};
use crate::task::{JobId, QueueId, TaskError};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Handle returned by completion-handler registration.
///
/// Token 0 ([`HandlerToken::FIRED`]) means the handler was invoked
/// synchronously because the task had already completed; it is not
/// removable. Stored tokens start at 1.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct HandlerToken(pub(crate) u32);

impl HandlerToken {
    /// The handler already ran; there is nothing to remove.
    pub const FIRED: HandlerToken = HandlerToken(0);

    pub const fn is_removable(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub(crate) enum WorkState {
    Waiting,
    Scheduled,
    Running,
    Completed,
    Canceled,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub(crate) enum WorkEvent {
    Schedule,
    RunStart,
    RunEnd,
    Cancel,
}

/// Minimal capability for holding successors of any result type.
///
/// A node producing `A` stores its continuations through this trait, so a
/// `then` closure returning `B` needs no type-parameterized back-reference.
pub(crate) trait Schedulable: Send + Sync + 'static {
    fn queue_id(&self) -> QueueId;
    fn job_id(&self) -> JobId;
    fn schedule(&self) -> bool;
    fn cancel(&self) -> bool;
}

pub(crate) type WorkFn<T> = Box<dyn FnOnce() -> TaskResult<T> + Send + 'static>;
pub(crate) type CompletionFn = Box<dyn FnOnce() + Send + 'static>;

/// Successor list and completion-handler table.
///
/// Lives in the state machine's payload slot so one mutex guards the state
/// and both collections; every "check the state, then mutate a collection"
/// decision is atomic.
pub(crate) struct NodeSlots {
    next_work: SmallVec<[Arc<dyn Schedulable>; 2]>,
    handlers: HashMap<u32, CompletionFn>,
    next_token: u32,
}

impl Default for NodeSlots {
    fn default() -> Self {
        Self {
            next_work: SmallVec::new(),
            handlers: HashMap::new(),
            // 0 is the fired-synchronously sentinel.
            next_token: 1,
        }
    }
}

/// The internal object behind a [`Task`](crate::task::Task): state machine,
/// promise, successor list and handler table for one unit of work.
///
/// State advances `Waiting → Scheduled → Running → Completed`, with
/// `Cancel` accepted only from `Waiting` and `Scheduled`. All side effects
/// are [`EffectScope::Deferred`]: they re-enter the machine (scheduling
/// eventually triggers `RunStart` from a worker thread) and call user code.
pub(crate) struct WorkNode<T> {
    queue_id: QueueId,

    // 0 until enqueued, swapped back to 0 by cancellation.
    job_id: AtomicU64,

    func: Mutex<Option<WorkFn<T>>>,
    promise: Promise<T>,
    future: SharedFuture<T>,
    machine: StateMachine<WorkState, WorkEvent, NodeSlots>,
}

impl<T: Send + 'static> WorkNode<T> {
    /// Creates the node in `Waiting`. The caller decides when to
    /// [`Schedulable::schedule`] it.
    pub(crate) fn new(queue_id: QueueId, func: WorkFn<T>) -> Arc<Self> {
        let (promise, future) = Promise::channel();

        let node = Arc::new(Self {
            queue_id,
            job_id: AtomicU64::new(0),
            func: Mutex::new(Some(func)),
            promise,
            future,
            machine: StateMachine::new(WorkState::Waiting),
        });

        Self::install_transitions(&node);
        node
    }

    fn install_transitions(node: &Arc<Self>) {
        use WorkEvent::*;
        use WorkState::*;

        // Effects hold weak references: the machine lives inside the node,
        // and whoever executes a transition already owns a strong ref.
        let weak = Arc::downgrade(node);
        node.machine
            .add_transition(Waiting, Scheduled, Schedule, EffectScope::Deferred, {
                let weak = Weak::clone(&weak);
                move |_, _, _| {
                    if let Some(node) = weak.upgrade() {
                        node.enqueue_job();
                    }
                }
            });

        node.machine
            .add_transition(Scheduled, Running, RunStart, EffectScope::Deferred, {
                let weak = Weak::clone(&weak);
                move |_, _, _| {
                    if let Some(node) = weak.upgrade() {
                        node.run();
                    }
                }
            });

        node.machine
            .add_transition(Running, Completed, RunEnd, EffectScope::Deferred, {
                let weak = Weak::clone(&weak);
                move |_, _, _| {
                    if let Some(node) = weak.upgrade() {
                        node.complete();
                    }
                }
            });

        for from in [Waiting, Scheduled] {
            node.machine
                .add_transition(from, Canceled, Cancel, EffectScope::Deferred, {
                    let weak = Weak::clone(&weak);
                    move |_, _, _| {
                        if let Some(node) = weak.upgrade() {
                            node.canceled();
                        }
                    }
                });
        }
    }

    /// `Waiting → Scheduled` effect: hand the job to the queue.
    fn enqueue_job(self: Arc<Self>) {
        // The closure owns a strong reference, pinning the node alive until
        // the job runs or is canceled.
        let node = Arc::clone(&self);
        let job_id = queue::registry::global().enqueue(
            self.queue_id,
            Box::new(move || {
                node.machine.execute_transition(WorkEvent::RunStart);
                node.machine.execute_transition(WorkEvent::RunEnd);
            }),
        );

        if job_id.is_none() {
            tracing::warn!(queue = %self.queue_id, "scheduled onto an unregistered queue");
        }
        self.job_id.store(job_id.as_u64(), Ordering::Release);
    }

    /// `Scheduled → Running` effect: invoke the wrapped function and
    /// fulfill the promise with whatever it produced.
    fn run(&self) {
        let Some(func) = self.func.lock().take() else {
            return;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(func))
            .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload))));
        self.promise.set(result);
    }

    /// `Running → Completed` effect: snapshot and clear both tables under
    /// the machine's mutex, then, with the lock released, invoke completion
    /// handlers first and schedule successors second. A handler observing
    /// "completed" therefore sees the same view a continuation will.
    fn complete(&self) {
        let (handlers, successors) = self.machine.with_data(|_, slots| {
            let handlers: Vec<CompletionFn> = slots.handlers.drain().map(|(_, f)| f).collect();
            let successors = std::mem::take(&mut slots.next_work);
            (handlers, successors)
        });

        for handler in handlers {
            handler();
        }
        for next in successors {
            next.schedule();
        }
    }

    /// `{Waiting, Scheduled} → Canceled` effect: best-effort removal of the
    /// pending job, then resolve the promise with `Canceled` so waiters
    /// return promptly, then cancel pending successors (a node that will
    /// never complete can never schedule them).
    fn canceled(&self) {
        let job_id = JobId::from_raw(self.job_id.swap(0, Ordering::AcqRel));
        if !job_id.is_none() {
            // Losing this race is fine: the job closure still runs, but the
            // machine rejects RunStart from Canceled, so the wrapped
            // function is never invoked.
            queue::registry::global().cancel(job_id);
        }

        self.promise.set(Err(TaskError::Canceled));

        let (handlers, successors) = self.machine.with_data(|_, slots| {
            let handlers: Vec<CompletionFn> = slots.handlers.drain().map(|(_, f)| f).collect();
            let successors = std::mem::take(&mut slots.next_work);
            (handlers, successors)
        });

        // Handlers are dropped unfired; they only report completion.
        drop(handlers);
        for next in successors {
            next.cancel();
        }
    }

    pub(crate) fn future(&self) -> SharedFuture<T> {
        self.future.clone()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.machine.current_state() == WorkState::Canceled
    }

    /// Appends a successor, or schedules it immediately if this node has
    /// already completed. Returns `false` iff this node was canceled, in
    /// which case the successor was not attached.
    pub(crate) fn add_next_work(&self, next: Arc<dyn Schedulable>) -> bool {
        enum Verdict {
            ScheduleNow(Arc<dyn Schedulable>),
            Stored,
            Rejected,
        }

        let verdict = self.machine.with_data(move |state, slots| match state {
            WorkState::Completed => Verdict::ScheduleNow(next),
            WorkState::Canceled => Verdict::Rejected,
            _ => {
                slots.next_work.push(next);
                Verdict::Stored
            }
        });

        match verdict {
            // Outside the mutex, per the usual effect discipline.
            Verdict::ScheduleNow(next) => {
                next.schedule();
                true
            }
            Verdict::Stored => true,
            Verdict::Rejected => false,
        }
    }

    /// Registers a completion handler. If the node has already completed,
    /// the handler runs synchronously on the calling thread and
    /// [`HandlerToken::FIRED`] is returned.
    pub(crate) fn add_completion_handler(&self, handler: CompletionFn) -> HandlerToken {
        let stored = self.machine.with_data(move |state, slots| {
            if state == WorkState::Completed {
                return Err(handler);
            }

            let token = slots.next_token;
            slots.next_token += 1;
            slots.handlers.insert(token, handler);
            Ok(HandlerToken(token))
        });

        match stored {
            Ok(token) => token,
            Err(handler) => {
                // Outside the mutex, on the caller's thread.
                handler();
                HandlerToken::FIRED
            }
        }
    }

    /// Removes a stored handler. `false` for [`HandlerToken::FIRED`] and
    /// for handlers that already fired (or were never registered here).
    pub(crate) fn remove_completion_handler(&self, token: HandlerToken) -> bool {
        if !token.is_removable() {
            return false;
        }

        let removed = self
            .machine
            .with_data(|_, slots| slots.handlers.remove(&token.0));

        // Dropped here, after the machine's mutex is released: the handler
        // may own task handles with their own teardown.
        removed.is_some()
    }
}

impl<T: Send + 'static> Schedulable for WorkNode<T> {
    fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    fn job_id(&self) -> JobId {
        JobId::from_raw(self.job_id.load(Ordering::Acquire))
    }

    fn schedule(&self) -> bool {
        self.machine.execute_transition(WorkEvent::Schedule) == WorkState::Scheduled
    }

    fn cancel(&self) -> bool {
        self.machine.execute_transition(WorkEvent::Cancel) == WorkState::Canceled
    }
}

impl<T> fmt::Debug for WorkNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkNode")
            .field("queue_id", &self.queue_id)
            .field("state", &self.machine.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{FifoQueue, JobQueue, register_queue, unregister_queue};
    use std::sync::atomic::AtomicU32;

    // Caller-driven queue registered globally, so node scheduling is fully
    // deterministic: nothing runs until the test pumps the queue.
    fn manual_queue() -> Arc<FifoQueue> {
        let queue = Arc::new(FifoQueue::new());
        register_queue(Arc::clone(&queue) as Arc<dyn JobQueue>);
        queue
    }

    fn noop_node(queue_id: QueueId) -> Arc<WorkNode<u32>> {
        WorkNode::new(queue_id, Box::new(|| Ok(7)))
    }

    #[test]
    fn test_schedule_enqueues_with_encoded_id() {
        let queue = manual_queue();
        let node = noop_node(queue.id());

        assert_eq!(node.job_id(), JobId::NONE);
        assert!(node.schedule());
        assert_eq!(node.job_id().queue_id(), queue.id());
        assert_eq!(queue.len(), 1);

        unregister_queue(queue.id());
    }

    #[test]
    fn test_drive_to_completion() {
        let queue = manual_queue();
        let node = noop_node(queue.id());
        node.schedule();

        assert!(queue.run_next());
        assert_eq!(node.machine.current_state(), WorkState::Completed);
        assert_eq!(node.future().get(), Ok(7));

        unregister_queue(queue.id());
    }

    #[test]
    fn test_cancel_from_scheduled_removes_job() {
        let queue = manual_queue();
        let counter = Arc::new(AtomicU32::new(0));
        let node = {
            let counter = Arc::clone(&counter);
            WorkNode::new(
                queue.id(),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
        };

        node.schedule();
        assert_eq!(queue.len(), 1);

        assert!(node.cancel());
        assert!(queue.is_empty());
        assert_eq!(node.job_id(), JobId::NONE);
        assert_eq!(node.future().get(), Err(TaskError::Canceled));

        // The wrapped function never ran.
        assert!(!queue.run_next());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        unregister_queue(queue.id());
    }

    #[test]
    fn test_cancel_losing_the_race_is_a_noop_job() {
        let queue = manual_queue();
        let counter = Arc::new(AtomicU32::new(0));
        let node = {
            let counter = Arc::clone(&counter);
            WorkNode::new(
                queue.id(),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
        };
        node.schedule();

        // Simulate the worker popping the job before cancel gets to the
        // queue: cancel first, then run the already-popped closure.
        let job = queue.pop_job().unwrap();
        assert!(node.cancel());
        (job.func)();

        assert_eq!(counter.load(Ordering::SeqCst), 0, "RunStart rejected from Canceled");
        assert_eq!(node.machine.current_state(), WorkState::Canceled);
        assert_eq!(node.future().get(), Err(TaskError::Canceled));

        unregister_queue(queue.id());
    }

    #[test]
    fn test_cancel_after_completion_is_rejected() {
        let queue = manual_queue();
        let node = noop_node(queue.id());
        node.schedule();
        queue.run_next();

        assert!(!node.cancel());
        assert!(!node.is_canceled());
        assert_eq!(node.future().get(), Ok(7));

        unregister_queue(queue.id());
    }

    #[test]
    fn test_handlers_fire_before_successors_are_scheduled() {
        let queue = manual_queue();
        let node = noop_node(queue.id());
        let successor = noop_node(queue.id());
        node.schedule();

        let handler_saw_empty_queue = Arc::new(AtomicU32::new(0));
        {
            let queue = Arc::clone(&queue);
            let flag = Arc::clone(&handler_saw_empty_queue);
            node.add_completion_handler(Box::new(move || {
                // The successor must not be enqueued yet.
                if queue.is_empty() {
                    flag.store(1, Ordering::SeqCst);
                }
            }));
        }
        node.add_next_work(Arc::clone(&successor) as Arc<dyn Schedulable>);

        assert!(queue.run_next());
        assert_eq!(handler_saw_empty_queue.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1, "successor enqueued after handlers");

        unregister_queue(queue.id());
    }

    #[test]
    fn test_add_next_work_after_completion_schedules_immediately() {
        let queue = manual_queue();
        let node = noop_node(queue.id());
        node.schedule();
        queue.run_next();

        let successor = noop_node(queue.id());
        assert!(node.add_next_work(Arc::clone(&successor) as Arc<dyn Schedulable>));
        assert_eq!(queue.len(), 1);

        unregister_queue(queue.id());
    }

    #[test]
    fn test_add_next_work_after_cancel_is_rejected() {
        let queue = manual_queue();
        let node = noop_node(queue.id());
        node.schedule();
        node.cancel();

        let successor = noop_node(queue.id());
        assert!(!node.add_next_work(Arc::clone(&successor) as Arc<dyn Schedulable>));
        assert!(queue.is_empty());

        unregister_queue(queue.id());
    }

    #[test]
    fn test_cancel_cascades_to_pending_successors() {
        let queue = manual_queue();
        let node = noop_node(queue.id());
        let successor = noop_node(queue.id());
        node.schedule();
        node.add_next_work(Arc::clone(&successor) as Arc<dyn Schedulable>);

        node.cancel();
        assert!(successor.is_canceled());
        assert_eq!(successor.future().get(), Err(TaskError::Canceled));

        unregister_queue(queue.id());
    }

    #[test]
    fn test_completion_handler_tokens() {
        let queue = manual_queue();
        let node = noop_node(queue.id());
        node.schedule();

        let fired = Arc::new(AtomicU32::new(0));

        let kept = {
            let fired = Arc::clone(&fired);
            node.add_completion_handler(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let removed = node.add_completion_handler(Box::new(|| panic!("removed handler fired")));

        // Stored tokens start at 1 and are distinct.
        assert!(kept.is_removable());
        assert!(removed.is_removable());
        assert_ne!(kept, removed);
        assert_eq!(kept, HandlerToken(1));

        assert!(node.remove_completion_handler(removed));
        assert!(!node.remove_completion_handler(removed));

        queue.run_next();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Already dispatched: not removable anymore.
        assert!(!node.remove_completion_handler(kept));

        unregister_queue(queue.id());
    }

    #[test]
    fn test_handler_after_completion_fires_synchronously() {
        let queue = manual_queue();
        let node = noop_node(queue.id());
        node.schedule();
        queue.run_next();

        let fired = Arc::new(AtomicU32::new(0));
        let token = {
            let fired = Arc::clone(&fired);
            node.add_completion_handler(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }))
        };

        assert_eq!(token, HandlerToken::FIRED);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!node.remove_completion_handler(token));

        unregister_queue(queue.id());
    }

    #[test]
    fn test_panicking_function_completes_with_error() {
        let queue = manual_queue();
        let node: Arc<WorkNode<u32>> = WorkNode::new(queue.id(), Box::new(|| panic!("boom")));
        let successor = noop_node(queue.id());
        node.schedule();
        node.add_next_work(Arc::clone(&successor) as Arc<dyn Schedulable>);

        queue.run_next();

        // Failure flows through the future; completion still happened, so
        // the successor was scheduled.
        assert_eq!(node.future().get(), Err(TaskError::Panicked("boom".into())));
        assert_eq!(node.machine.current_state(), WorkState::Completed);
        assert_eq!(queue.len(), 1);

        unregister_queue(queue.id());
    }

    #[test]
    fn test_enqueue_onto_unknown_queue_leaves_job_id_none() {
        // Deliberately not registered.
        let node = noop_node(QueueId::next());
        assert!(node.schedule());
        assert_eq!(node.job_id(), JobId::NONE);
    }
}
