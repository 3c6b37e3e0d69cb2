/// Why a task's future resolved without a value.
///
/// The error is `Clone` because a [`SharedFuture`](crate::task::SharedFuture)
/// hands the same outcome to every waiter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task was canceled while still in `Waiting` or `Scheduled`.
    /// Its wrapped function never ran.
    #[error("task was canceled before it ran")]
    Canceled,

    /// The wrapped function panicked. The payload's message is preserved
    /// so callers can log something better than "task failed".
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked(_))
    }
}

/// Extracts a printable message from a `catch_unwind` payload.
///
/// Panic payloads are almost always `&str` or `String`; anything else is
/// reported as opaque.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
