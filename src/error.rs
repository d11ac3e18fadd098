//! The error type shared by executors and tasks.

use std::{any::Any, error::Error as StdError, fmt, sync::Arc};

use crate::executor::ExecutorId;

/// Errors produced by executors and observed when a [`Task`] is awaited or blocked on.
///
/// [`Error`] is [`Clone`] so that the outcome of a single task can be handed to every awaiter.
///
/// [`Task`]: crate::Task
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The work backing a task failed; carries the original reason.
    #[error("worker failed: {0}")]
    WorkerFailure(Fault),

    /// The operation observed a cancellation request and stopped.
    ///
    /// This is deliberately distinct from [`Error::WorkerFailure`].
    #[error("operation was cancelled")]
    Cancelled,

    /// Blocking the calling thread would starve the only thread able to complete the task.
    #[error(
        "blocking the owning thread of executor {executor} would deadlock: \
         the awaited task can only resume on that executor"
    )]
    DeadlockDetected { executor: ExecutorId },

    /// A blocking wait was attempted on the timer thread.
    ///
    /// Every timer in the process, possibly including the one the awaited task depends on, would
    /// stall until the wait returns.
    #[error("blocking the timer thread would stall every timer in the process")]
    TimerDeadlock,

    /// Work was posted to an executor that has been shut down.
    #[error("executor {0} has been torn down")]
    PostAfterTeardown(ExecutorId),

    /// An operation reserved for the owning thread was called from another thread.
    #[error("executor {0} can only be pumped from its owning thread")]
    NotOwningThread(ExecutorId),
}

impl Error {
    /// Wraps an arbitrary error as a [`Error::WorkerFailure`].
    ///
    /// Meant for use with `map_err` inside worker closures.
    pub fn failure<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::WorkerFailure(Fault::new(error))
    }

    /// Returns `true` if this is [`Error::Cancelled`].
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// The reason a task faulted.
///
/// Cloning a [`Fault`] is cheap; all clones refer to the same underlying error.
#[derive(Clone)]
pub struct Fault(Arc<dyn StdError + Send + Sync>);

impl Fault {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Fault(Arc::new(error))
    }

    /// Creates a [`Fault`] that only carries a message.
    pub fn msg<M: fmt::Display>(message: M) -> Self {
        Fault::new(Message(message.to_string()))
    }

    /// Turns a panic payload into a [`Fault`], keeping the panic message if there is one.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Fault::new(Panicked(message))
    }

    /// Returns the underlying error.
    pub fn get(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }

    /// Returns `true` if `self` and `other` were cloned from the same [`Fault`].
    pub fn ptr_eq(&self, other: &Fault) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
struct Panicked(String);
