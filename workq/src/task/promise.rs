use crate::task::TaskError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// What a task's future ultimately resolves to.
pub type TaskResult<T> = Result<T, TaskError>;

struct Shared<T> {
    slot: Mutex<Option<TaskResult<T>>>,
    cond: Condvar,
}

/// Write-once side of a [`SharedFuture`].
///
/// The first [`Promise::set`] wins; later writes are dropped and reported
/// with `false`. The work node's state machine guarantees there is only one
/// writer in practice (the `RunStart` effect or a `Cancel` effect, never
/// both), so a lost write is a bug upstream rather than an expected path.
pub(crate) struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// Blocking, cloneable handle to a task's eventual result.
///
/// Any number of clones may wait; all of them observe the same outcome.
/// [`SharedFuture::get`] hands out an owned copy of the value, which is why
/// task result types are `Clone`.
pub struct SharedFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    pub(crate) fn channel() -> (Promise<T>, SharedFuture<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        (
            Promise {
                shared: Arc::clone(&shared),
            },
            SharedFuture { shared },
        )
    }

    /// Fulfills the future, waking every waiter. Returns `false` if the
    /// future was already fulfilled.
    pub(crate) fn set(&self, result: TaskResult<T>) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        drop(slot);

        self.shared.cond.notify_all();
        true
    }
}

impl<T> SharedFuture<T> {
    /// Blocks until the future is fulfilled, without extracting the value.
    pub fn wait(&self) {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.cond.wait(&mut slot);
        }
    }

    /// Non-blocking probe. `None` while the task is still in flight.
    pub fn try_get(&self) -> Option<TaskResult<T>>
    where
        T: Clone,
    {
        self.shared.slot.lock().clone()
    }

    /// Blocks until the future is fulfilled and returns the outcome.
    pub fn get(&self) -> TaskResult<T>
    where
        T: Clone,
    {
        let mut slot = self.shared.slot.lock();
        loop {
            match slot.as_ref() {
                Some(result) => return result.clone(),
                None => self.shared.cond.wait(&mut slot),
            }
        }
    }
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_set_then_get() {
        let (promise, future) = Promise::channel();
        assert!(future.try_get().is_none());

        assert!(promise.set(Ok(7)));
        assert_eq!(future.get(), Ok(7));
        assert_eq!(future.try_get(), Some(Ok(7)));
    }

    #[test]
    fn test_first_write_wins() {
        let (promise, future) = Promise::channel();
        assert!(promise.set(Ok(1)));
        assert!(!promise.set(Ok(2)));
        assert_eq!(future.get(), Ok(1));
    }

    #[test]
    fn test_get_blocks_until_fulfilled() {
        let (promise, future) = Promise::channel();

        let waiter = {
            let future = future.clone();
            thread::spawn(move || future.get())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(promise.set(Ok("ready".to_string())));
        assert_eq!(waiter.join().unwrap(), Ok("ready".to_string()));
    }

    #[test]
    fn test_all_clones_observe_the_error() {
        let (promise, future) = Promise::<u32>::channel();
        let other = future.clone();

        promise.set(Err(TaskError::Canceled));
        assert_eq!(future.get(), Err(TaskError::Canceled));
        assert_eq!(other.get(), Err(TaskError::Canceled));
    }
}
