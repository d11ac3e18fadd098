//! Cooperative cancellation.
//!
//! A [`CancellationSource`] owns the right to request cancellation; the [`CancellationToken`]s
//! handed out by it can only observe the request. Nothing is ever interrupted forcibly: code that
//! wants to be cancellable has to poll its token (typically via [`CancellationToken::checkpoint`]
//! once per unit of work) or register an observer. Work that never looks at its token cannot be
//! cancelled.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{timer, Error};

type Observer = Box<dyn FnOnce() + Send>;

struct Shared {
    requested: AtomicBool,
    /// Observers in registration order. Emptied exactly once, when cancellation is requested.
    observers: Mutex<Observers>,
}

struct Observers {
    next_id: u64,
    list: Vec<(u64, Observer)>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            requested: AtomicBool::new(false),
            observers: Mutex::new(Observers {
                next_id: 0,
                list: Vec::new(),
            }),
        })
    }

    fn request(&self) {
        let observers = {
            let mut observers = self.observers.lock();
            // Flipped under the lock so that `register` can never miss the transition.
            if self.requested.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut observers.list)
        };
        log::trace!("cancellation requested, notifying {} observers", observers.len());
        for (_, observer) in observers {
            observer();
        }
    }
}

/// The owning side of a cancellation request.
///
/// Dropping the source does not request cancellation; tokens obtained from a dropped source simply
/// stay un-requested forever.
pub struct CancellationSource {
    shared: Arc<Shared>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Some(self.shared.clone()),
        }
    }

    /// Requests cancellation.
    ///
    /// The first call sets the flag and synchronously runs every registered observer, in
    /// registration order, on the calling thread. Later calls do nothing.
    pub fn cancel(&self) {
        self.shared.request();
    }

    /// Requests cancellation once `delay` has elapsed.
    ///
    /// The request is made from the timer thread, so observers registered on the token will run
    /// there. Calling [`CancellationSource::cancel`] earlier is fine; the timer then does nothing.
    pub fn cancel_after(&self, delay: Duration) {
        let shared = Arc::downgrade(&self.shared);
        let scheduled = timer::schedule(Instant::now() + delay, move || {
            if let Some(shared) = shared.upgrade() {
                shared.request();
            }
        });
        if let Err(e) = scheduled {
            log::warn!("failed to arm cancellation timer ({e}), cancelling now");
            self.cancel();
        }
    }

    #[inline]
    pub fn is_cancellation_requested(&self) -> bool {
        self.shared.requested.load(Ordering::SeqCst)
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("requested", &self.is_cancellation_requested())
            .finish()
    }
}

/// A read-only view of a [`CancellationSource`].
///
/// Tokens are cheap to clone and can be moved to any thread.
#[derive(Clone)]
pub struct CancellationToken {
    /// `None` for tokens that can never be cancelled.
    shared: Option<Arc<Shared>>,
}

impl CancellationToken {
    /// Returns a token that is never requested.
    pub fn none() -> Self {
        Self { shared: None }
    }

    /// Non-blocking poll of the cancellation flag.
    #[inline]
    pub fn is_requested(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.requested.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Returns `true` if this token is connected to a [`CancellationSource`].
    #[inline]
    pub fn can_be_cancelled(&self) -> bool {
        self.shared.is_some()
    }

    /// Returns [`Error::Cancelled`] if cancellation has been requested.
    ///
    /// Intended to be called with `?` at every cancellation checkpoint of a worker:
    ///
    /// ```
    /// use cooperate::{CancellationSource, Error};
    ///
    /// let source = CancellationSource::new();
    /// let token = source.token();
    /// let work = |count: u32| -> Result<u32, Error> {
    ///     let mut done = 0;
    ///     for _ in 0..count {
    ///         token.checkpoint()?;
    ///         done += 1;
    ///     }
    ///     Ok(done)
    /// };
    /// assert_eq!(work(3).unwrap(), 3);
    /// source.cancel();
    /// assert!(work(3).unwrap_err().is_cancelled());
    /// ```
    #[inline]
    pub fn checkpoint(&self) -> Result<(), Error> {
        if self.is_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Registers `callback` to run when cancellation is requested.
    ///
    /// If cancellation has already been requested, `callback` runs immediately, on the calling
    /// thread, before this method returns. Otherwise it runs on the thread that requests
    /// cancellation. Every callback runs at most once.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(shared) = &self.shared else {
            return Registration::inert();
        };

        let mut observers = shared.observers.lock();
        if shared.requested.load(Ordering::SeqCst) {
            drop(observers);
            callback();
            return Registration::inert();
        }
        let id = observers.next_id;
        observers.next_id += 1;
        observers.list.push((id, Box::new(callback)));
        Registration {
            shared: Arc::downgrade(shared),
            id,
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("requested", &self.is_requested())
            .field("can_be_cancelled", &self.can_be_cancelled())
            .finish()
    }
}

/// Handle to an observer registered with [`CancellationToken::register`].
///
/// Dropping a [`Registration`] leaves the observer registered.
#[must_use = "dropping a `Registration` does not unregister the observer"]
#[derive(Debug)]
pub struct Registration {
    shared: Weak<Shared>,
    id: u64,
}

impl Registration {
    fn inert() -> Self {
        Self {
            shared: Weak::new(),
            id: 0,
        }
    }

    /// Removes the observer if it has not run yet.
    ///
    /// Returns `true` if the observer was removed, `false` if it already ran (or never will).
    pub fn unregister(self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut observers = shared.observers.lock();
        match observers.list.iter().position(|(id, _)| *id == self.id) {
            Some(index) => {
                observers.list.remove(index);
                true
            }
            None => false,
        }
    }
}
