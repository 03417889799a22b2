//! Host scheduler boundary: the pending unit of work a context signals.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::ContextError;

/// A unit of work waiting for asynchronous GPU work to finish.
///
/// Implemented by the host scheduler. `done_waiting` may be called from
/// any thread, including driver callback threads.
pub trait WaitingTask: Send + Sync {
    /// Called once the awaited work finished, with the error if it failed.
    fn done_waiting(&self, error: Option<ContextError>);
}

type Completion = Box<dyn FnOnce(Option<ContextError>) + Send + 'static>;

/// Single-use handle that signals a [`WaitingTask`].
///
/// Signalled exactly once: either explicitly through
/// [`done_waiting`](Self::done_waiting) or, if it is dropped unsignalled,
/// with no error.
pub struct WaitingTaskHolder {
    completion: Option<Completion>,
}

impl WaitingTaskHolder {
    /// Wraps a scheduler task.
    pub fn new(task: Arc<dyn WaitingTask>) -> Self {
        Self::from_fn(move |error| task.done_waiting(error))
    }

    /// Creates a holder that runs `f` when signalled.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(Option<ContextError>) + Send + 'static,
    {
        Self {
            completion: Some(Box::new(f)),
        }
    }

    /// Creates a holder that does nothing when signalled.
    pub fn noop() -> Self {
        Self::from_fn(|_| {})
    }

    /// Signals the task.
    pub fn done_waiting(mut self, error: Option<ContextError>) {
        self.signal(error);
    }

    fn signal(&mut self, error: Option<ContextError>) {
        if let Some(completion) = self.completion.take() {
            completion(error);
        }
    }
}

impl Drop for WaitingTaskHolder {
    fn drop(&mut self) {
        if self.completion.is_some() {
            trace!("Waiting task holder released without explicit signal");
            self.signal(None);
        }
    }
}

impl fmt::Debug for WaitingTaskHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitingTaskHolder")
            .field("pending", &self.completion.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct CountingTask {
        signals: AtomicUsize,
        last_error: Mutex<Option<ContextError>>,
    }

    impl WaitingTask for CountingTask {
        fn done_waiting(&self, error: Option<ContextError>) {
            self.signals.fetch_add(1, Ordering::SeqCst);
            *self.last_error.lock() = error;
        }
    }

    #[test]
    fn test_signal_once() {
        let task = Arc::new(CountingTask::default());
        let holder = WaitingTaskHolder::new(task.clone());
        holder.done_waiting(Some(ContextError::NoContextState));

        assert_eq!(task.signals.load(Ordering::SeqCst), 1);
        assert_eq!(*task.last_error.lock(), Some(ContextError::NoContextState));
    }

    #[test]
    fn test_drop_signals_success() {
        let task = Arc::new(CountingTask::default());
        drop(WaitingTaskHolder::new(task.clone()));

        assert_eq!(task.signals.load(Ordering::SeqCst), 1);
        assert_eq!(*task.last_error.lock(), None);
    }
}
