//! Fan-in combinators: [`when_any`], [`when_all`], and the infix `|` / `&`
//! sugar over two tasks.
//!
//! Both combinators are themselves tasks: they subscribe a completion
//! handler to every input, block on a local condition variable until enough
//! inputs have fired, unhook the rest, and resolve with the input handles
//! completed so far, in completion order.
//!
//! # Worker occupancy
//!
//! The combinator body occupies one worker of its target queue for the
//! whole wait. Running it on the same pool that produces its inputs can
//! deadlock once the pool has fewer workers than there are concurrent
//! waits plus the tasks they depend on. Route combinators to a queue of
//! their own; the tests here do.

use crate::task::{HandlerToken, QueueId, Task, create_task};
use parking_lot::{Condvar, Mutex};
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;

/// Collects completed input handles and wakes the combinator body.
struct Gate<T> {
    completed: Mutex<Vec<Task<T>>>,
    cond: Condvar,
}

impl<T> Gate<T> {
    fn new() -> Self {
        Self {
            completed: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, task: Task<T>) {
        self.completed.lock().push(task);
        self.cond.notify_one();
    }

    /// Blocks until at least `quota` inputs fired, then snapshots the list
    /// under the lock. Later completions may still land in the gate; they
    /// are not part of the snapshot.
    fn wait_for(&self, quota: usize) -> Vec<Task<T>> {
        let mut completed = self.completed.lock();
        while completed.len() < quota {
            self.cond.wait(&mut completed);
        }
        completed.clone()
    }
}

fn fan_in<T>(queue_id: QueueId, tasks: Vec<Task<T>>, quota: usize) -> Task<Vec<Task<T>>>
where
    T: Clone + Send + 'static,
{
    create_task(queue_id, move || {
        let gate = Arc::new(Gate::new());

        // One token per input, kept so handlers that never fire can be
        // removed after the wait. Already-completed inputs fire the handler
        // synchronously right here and yield HandlerToken::FIRED.
        let tokens: Vec<HandlerToken> = tasks
            .iter()
            .map(|task| {
                let gate = Arc::clone(&gate);
                task.add_completion_handler(move |done| gate.push(done))
            })
            .collect();

        let completed = gate.wait_for(quota);

        for (task, token) in tasks.iter().zip(tokens) {
            // Racing a late completion is fine: either the removal wins and
            // the handler never fires, or it already fired and this is a
            // no-op returning false.
            task.remove_completion_handler(token);
        }

        completed
    })
}

/// A task resolving with the inputs that completed by the time at least one
/// had: a non-empty subset, in completion order (empty for empty input).
///
/// The combinator task runs on `queue_id`; see the module docs for why that
/// queue should not be the one producing the inputs.
pub fn when_any<T, I>(queue_id: QueueId, tasks: I) -> Task<Vec<Task<T>>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    let tasks: Vec<Task<T>> = tasks.into_iter().collect();
    let quota = tasks.len().min(1);
    fan_in(queue_id, tasks, quota)
}

/// A task resolving with every input once all of them completed, in
/// completion order.
pub fn when_all<T, I>(queue_id: QueueId, tasks: I) -> Task<Vec<Task<T>>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    let tasks: Vec<Task<T>> = tasks.into_iter().collect();
    let quota = tasks.len();
    fan_in(queue_id, tasks, quota)
}

// Rust cannot overload the short-circuiting `||` / `&&`, so the two-task
// sugar rides on the bit operators, defaulting the target queue to the left
// operand's.

impl<T> BitOr for Task<T>
where
    T: Clone + Send + 'static,
{
    type Output = Task<Vec<Task<T>>>;

    /// `a | b`: [`when_any`] over the pair, on `a`'s queue.
    fn bitor(self, rhs: Task<T>) -> Self::Output {
        let queue_id = self.queue_id();
        when_any(queue_id, [self, rhs])
    }
}

impl<T> BitAnd for Task<T>
where
    T: Clone + Send + 'static,
{
    type Output = Task<Vec<Task<T>>>;

    /// `a & b`: [`when_all`] over the pair, on `a`'s queue.
    fn bitand(self, rhs: Task<T>) -> Self::Output {
        let queue_id = self.queue_id();
        when_all(queue_id, [self, rhs])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_when_any_over_empty_input() {
        let combinators = spawn_pool(1);

        let any: Task<Vec<Task<u32>>> = when_any(combinators, []);
        assert_eq!(any.get().unwrap().len(), 0);

        retire_pool(combinators);
    }

    #[test]
    fn test_when_any_with_already_completed_inputs() {
        let workers = spawn_pool(2);
        let combinators = spawn_pool(1);

        let task = create_task(workers, || 5u32);
        task.wait();

        let any = when_any(combinators, [task.clone()]);
        let completed = any.get().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].get().unwrap(), 5);

        retire_pool(workers);
        retire_pool(combinators);
    }

    #[test]
    fn test_when_all_preserves_completion_order() {
        let workers = spawn_pool(1);
        let combinators = spawn_pool(1);

        // One worker: completion order is enqueue order.
        let tasks: Vec<Task<u32>> = (0..4).map(|i| create_task(workers, move || i)).collect();
        let all = when_all(combinators, tasks);

        let values: Vec<u32> = all
            .get()
            .unwrap()
            .iter()
            .map(|t| t.get().unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3]);

        retire_pool(workers);
        retire_pool(combinators);
    }

    #[test]
    fn test_operators_default_to_left_queue() {
        let workers = spawn_pool(4);

        let a = create_task(workers, || 1u32);
        let b = create_task(workers, || 2u32);
        let any = a.clone() | b.clone();
        assert_eq!(any.queue_id(), a.queue_id());

        let all = a & b;
        assert!(!all.get().unwrap().is_empty());

        retire_pool(workers);
    }
}
