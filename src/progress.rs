//! Progress reporting from workers back to an executor.

use std::{fmt, sync::Arc};

use crate::{Error, Executor};

/// Delivers progress values to a callback that runs on a fixed [`Executor`].
///
/// The executor is bound when the [`Progress`] is created, typically on the thread that owns the
/// UI. Any thread holding a clone can then [`report`] values; each report posts one callback
/// invocation, so values reported from a single thread arrive in the order they were reported.
///
/// [`report`]: Progress::report
pub struct Progress<T> {
    executor: Executor,
    callback: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T> Clone for Progress<T> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            callback: self.callback.clone(),
        }
    }
}

impl<T: Send + 'static> Progress<T> {
    /// Creates a [`Progress`] whose `callback` runs on `executor`.
    pub fn new<F>(executor: &Executor, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            executor: executor.clone(),
            callback: Arc::new(callback),
        }
    }

    /// Creates a [`Progress`] bound to the calling thread's current executor.
    ///
    /// Returns [`None`] if the calling thread does not own an executor.
    pub fn on_current<F>(callback: F) -> Option<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Executor::current().map(|executor| Self::new(&executor, callback))
    }

    /// Reports `value`.
    ///
    /// Never blocks, and never runs the callback synchronously, even on the executor's owning
    /// thread. Fails with [`Error::PostAfterTeardown`] if the executor has been torn down.
    pub fn report(&self, value: T) -> Result<(), Error> {
        let callback = self.callback.clone();
        self.executor.post(move || callback(value))
    }

    /// Returns the executor the callback runs on.
    #[inline]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

impl<T> fmt::Debug for Progress<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}
