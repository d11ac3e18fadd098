//! The single-threaded executor.
//!
//! An [`Executor`] models one serial execution context, such as a UI thread: any thread may
//! [`post`] work to it, but only the thread that created it (its *owning thread*) runs that work,
//! one item at a time and in posting order, whenever it pumps the queue.
//!
//! [`post`]: Executor::post

use std::{
    cell::RefCell,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

use crate::{Error, Task};

type Work = Box<dyn FnOnce() + Send>;

thread_local! {
    /// The executor owned by this thread, if any.
    static CURRENT: RefCell<Weak<Shared>> = RefCell::new(Weak::new());
}

/// Process-unique identity of an [`Executor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorId(u64);

impl ExecutorId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ExecutorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A builder object that can be used to configure and create an [`Executor`].
#[derive(Clone)]
pub struct ExecutorBuilder {
    name: Option<String>,
    deadlock_detection: bool,
}

impl ExecutorBuilder {
    /// Sets the name of the [`Executor`], used in log messages.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Enables or disables detection of deadlocking [`Task::block`] calls on the owning thread.
    ///
    /// Enabled by default in debug builds.
    #[inline]
    pub fn deadlock_detection(self, enabled: bool) -> Self {
        Self {
            deadlock_detection: enabled,
            ..self
        }
    }

    /// Creates the [`Executor`], owned by the calling thread.
    ///
    /// The executor becomes the calling thread's current executor (see [`Executor::current`]),
    /// replacing any executor the thread owned before.
    pub fn build(self) -> Executor {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            id: ExecutorId::next(),
            name: self.name,
            owner: thread::current().id(),
            deadlock_detection: self.deadlock_detection,
            sender,
            receiver,
            torn_down: RwLock::new(false),
        });

        CURRENT.with(|current| {
            let previous = current.replace(Arc::downgrade(&shared));
            if let Some(previous) = previous.upgrade() {
                log::warn!(
                    "executor {} replaces executor {} as the current executor of this thread",
                    shared.id,
                    previous.id,
                );
            }
        });

        let executor = Executor { shared };
        log::debug!("created executor {executor:?}");
        executor
    }
}

struct Shared {
    id: ExecutorId,
    name: Option<String>,
    owner: ThreadId,
    deadlock_detection: bool,
    sender: Sender<Work>,
    /// Only ever drained by the owning thread.
    receiver: Receiver<Work>,
    /// Held for reading while posting, so that teardown cannot race with a post.
    torn_down: RwLock<bool>,
}

/// A handle to a single-threaded executor.
///
/// Handles are cheap to clone and can be sent to other threads, which can then [`post`] work to
/// the executor. Only the owning thread can run that work.
///
/// [`post`]: Executor::post
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    /// Returns a builder that can be used to configure and create an [`Executor`].
    #[inline]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder {
            name: None,
            deadlock_detection: cfg!(debug_assertions),
        }
    }

    /// Creates an [`Executor`] with default configuration, owned by the calling thread.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns the executor owned by the calling thread, if any.
    ///
    /// This is the context that continuations capture.
    pub fn current() -> Option<Executor> {
        CURRENT
            .with(|current| current.borrow().upgrade())
            .map(|shared| Executor { shared })
    }

    #[inline]
    pub fn id(&self) -> ExecutorId {
        self.shared.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Returns `true` if the calling thread is the executor's owning thread.
    ///
    /// State owned by the executor may only be touched directly when this returns `true`; other
    /// threads have to [`post`] the change instead.
    ///
    /// [`post`]: Executor::post
    #[inline]
    pub fn is_owning_context(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    /// Returns a handle that does not keep the executor's queue alive.
    pub(crate) fn downgrade(&self) -> WeakExecutor {
        WeakExecutor {
            shared: Arc::downgrade(&self.shared),
            id: self.id(),
        }
    }

    pub(crate) fn detects_deadlocks(&self) -> bool {
        self.shared.deadlock_detection
    }

    pub fn is_torn_down(&self) -> bool {
        *self.shared.torn_down.read()
    }

    /// Appends `work` to the executor's queue.
    ///
    /// Never blocks. May be called from any thread, including the owning thread and from inside
    /// running work. Fails with [`Error::PostAfterTeardown`] once the executor has been shut down.
    pub fn post<F>(&self, work: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let torn_down = self.shared.torn_down.read();
        if *torn_down {
            return Err(Error::PostAfterTeardown(self.id()));
        }
        // Cannot fail, `self.shared` holds the receiver.
        self.shared
            .sender
            .send(Box::new(work))
            .map_err(|_| Error::PostAfterTeardown(self.id()))
    }

    fn ensure_owner(&self) -> Result<(), Error> {
        if self.is_owning_context() {
            Ok(())
        } else {
            Err(Error::NotOwningThread(self.id()))
        }
    }

    /// Runs queued work, one item at a time, until the queue is empty.
    ///
    /// Work posted while this runs (including by the running work itself) is run as well. Work may
    /// also pump the executor re-entrantly. Returns the number of items run.
    ///
    /// If a work item panics, the panic propagates to the caller; the remaining items stay queued.
    ///
    /// Fails with [`Error::NotOwningThread`] when called from any thread but the owning one.
    pub fn run_pending_work(&self) -> Result<usize, Error> {
        self.pump(None)
    }

    /// Like [`Executor::run_pending_work`], but stops starting new work once `budget` has elapsed.
    ///
    /// At least one item is run if the queue is not empty.
    pub fn run_pending_work_for(&self, budget: Duration) -> Result<usize, Error> {
        self.pump(Some(Instant::now() + budget))
    }

    fn pump(&self, deadline: Option<Instant>) -> Result<usize, Error> {
        self.ensure_owner()?;
        let mut ran = 0;
        while let Ok(work) = self.shared.receiver.try_recv() {
            work();
            ran += 1;
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                break;
            }
        }
        Ok(ran)
    }

    /// Runs queued work until `task` is terminal, then returns the task's outcome.
    ///
    /// This is how the owning thread should wait for a task: unlike [`Task::block`], it keeps the
    /// executor running, so continuations that need this executor can still complete the task.
    /// When the queue is empty, the thread sleeps until more work is posted.
    ///
    /// Fails with [`Error::NotOwningThread`] off the owning thread, and with
    /// [`Error::PostAfterTeardown`] if the executor is shut down before the task is terminal.
    pub fn run_until<T>(&self, task: &Task<T>) -> Result<T, Error>
    where
        T: Clone + Send + 'static,
    {
        self.ensure_owner()?;
        if let Some(result) = task.try_result() {
            return result;
        }
        if self.is_torn_down() {
            return Err(Error::PostAfterTeardown(self.id()));
        }

        let wake = self.downgrade();
        task.continue_with(false, move |_| {
            // Only needed to get the pump below out of `recv`; a torn-down executor is already
            // woken by `shutdown`.
            if let Some(executor) = wake.upgrade() {
                let _ = executor.post(|| {});
            }
        });

        loop {
            if let Some(result) = task.try_result() {
                return result;
            }
            if self.is_torn_down() {
                return Err(Error::PostAfterTeardown(self.id()));
            }
            match self.shared.receiver.recv() {
                Ok(work) => work(),
                Err(_) => return Err(Error::PostAfterTeardown(self.id())),
            }
        }
    }

    /// Tears the executor down.
    ///
    /// Queued work is dropped without running, later posts fail with
    /// [`Error::PostAfterTeardown`], and a pending [`Executor::run_until`] returns. If called on the
    /// owning thread, the executor stops being that thread's current executor. Calling this more
    /// than once has no further effect.
    pub fn shutdown(&self) {
        let dropped: Vec<Work> = {
            let mut torn_down = self.shared.torn_down.write();
            if *torn_down {
                return;
            }
            *torn_down = true;
            self.shared.receiver.try_iter().collect()
        };
        log::debug!(
            "executor {:?} torn down, dropping {} queued items",
            self,
            dropped.len()
        );
        // Dropping work can settle tasks, which may try to post again; the lock is released.
        drop(dropped);

        // Wakes a `run_until` waiting in `recv`.
        let _ = self.shared.sender.send(Box::new(|| {}));

        if self.is_owning_context() {
            CURRENT.with(|current| {
                let mut current = current.borrow_mut();
                if Weak::ptr_eq(&*current, &Arc::downgrade(&self.shared)) {
                    *current = Weak::new();
                }
            });
        }
    }
}

/// A non-owning [`Executor`] handle.
///
/// Held by work that sits in the executor's own queue, which would otherwise keep the executor
/// alive forever.
#[derive(Clone)]
pub(crate) struct WeakExecutor {
    shared: Weak<Shared>,
    id: ExecutorId,
}

impl WeakExecutor {
    pub(crate) fn upgrade(&self) -> Option<Executor> {
        self.shared.upgrade().map(|shared| Executor { shared })
    }

    #[inline]
    pub(crate) fn id(&self) -> ExecutorId {
        self.id
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shared.name {
            Some(name) => write!(f, "{} '{}'", self.shared.id, name),
            None => write!(f, "{}", self.shared.id),
        }
    }
}
