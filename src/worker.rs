//! Running blocking work on dedicated worker threads.

use std::{
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    thread,
};

use crate::{drop::defer, promise, CancellationToken, Error, Fault, Task};

/// A builder object that can be used to configure and spawn a worker thread.
#[derive(Clone, Default)]
pub struct WorkerBuilder {
    name: Option<String>,
    token: Option<CancellationToken>,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the worker thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the [`CancellationToken`] handed to the worker closure.
    ///
    /// Defaults to [`CancellationToken::none`].
    pub fn cancellation(self, token: CancellationToken) -> Self {
        Self {
            token: Some(token),
            ..self
        }
    }

    /// Spawns a thread running `f` and returns a [`Task`] for its outcome.
    ///
    /// The task is [`Running`] while `f` runs. It then completes with `f`'s value, is cancelled if
    /// `f` returns [`Error::Cancelled`], and faults if `f` returns any other error or panics. If the
    /// token was already requested before spawning, no thread is started and the returned task is
    /// cancelled.
    ///
    /// Only fails if the operating system refuses to spawn the thread.
    ///
    /// [`Running`]: crate::TaskState::Running
    pub fn spawn<T, F>(self, f: F) -> io::Result<Task<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, Error> + Send + 'static,
    {
        let token = self.token.unwrap_or_else(CancellationToken::none);
        if token.is_requested() {
            return Ok(Task::cancelled());
        }

        let (promise, task) = promise();
        promise.start();

        let mut builder = thread::Builder::new();
        if let Some(name) = self.name.clone() {
            builder = builder.name(name);
        }
        builder.spawn(move || {
            let _guard;
            if let Some(name) = self.name {
                log::trace!("worker '{name}' starting");
                _guard = defer(move || log::trace!("worker '{name}' exiting"));
            }

            let result = match catch_unwind(AssertUnwindSafe(|| f(&token))) {
                Ok(result) => result,
                Err(payload) => Err(Error::WorkerFailure(Fault::from_panic(payload))),
            };
            promise.settle(result);
        })?;

        Ok(task)
    }
}

/// Runs `f` on a new worker thread, returning a [`Task`] for its outcome.
///
/// This is a shorthand for `WorkerBuilder::new().spawn(f)`, where a failure to spawn the thread
/// faults the returned task instead of being returned.
///
/// # Examples
///
/// Offload a computation and wait for it on the owning thread of an [`Executor`], reporting
/// progress along the way:
///
/// ```
/// use cooperate::{run_on_worker, Executor, Progress};
/// use std::sync::{Arc, Mutex};
///
/// let executor = Executor::new();
/// let last = Arc::new(Mutex::new(0));
/// let l = last.clone();
/// let progress = Progress::new(&executor, move |done: u64| *l.lock().unwrap() = done);
///
/// let task = run_on_worker(move |token| {
///     let mut sum = 0u64;
///     for i in 1..=10 {
///         token.checkpoint()?;
///         sum += i;
///         progress.report(i)?;
///     }
///     Ok(sum)
/// });
/// assert_eq!(executor.run_until(&task).unwrap(), 55);
/// executor.run_pending_work().unwrap();
/// assert_eq!(*last.lock().unwrap(), 10);
/// ```
///
/// [`Executor`]: crate::Executor
pub fn run_on_worker<T, F>(f: F) -> Task<T>
where
    T: Clone + Send + 'static,
    F: FnOnce(&CancellationToken) -> Result<T, Error> + Send + 'static,
{
    match WorkerBuilder::new().spawn(f) {
        Ok(task) => task,
        Err(e) => {
            log::warn!("failed to spawn worker thread: {e}");
            Task::faulted(Fault::new(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{CancellationSource, TaskState};

    #[test]
    fn completes_with_value() {
        let task = run_on_worker(|_| Ok(6 * 7));
        assert_eq!(task.block().unwrap(), 42);
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn running_while_work_runs() {
        let (release, wait) = crossbeam_channel::bounded::<()>(0);
        let task = run_on_worker(move |_| {
            wait.recv().map_err(Error::failure)?;
            Ok(())
        });
        assert_eq!(task.state(), TaskState::Running);
        release.send(()).unwrap();
        task.block().unwrap();
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn cancellation_stops_at_next_checkpoint() {
        let source = CancellationSource::new();
        let token = source.token();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let task = WorkerBuilder::new()
            .cancellation(token)
            .spawn(move |token| {
                for i in 0..500 {
                    token.checkpoint()?;
                    if i == 50 {
                        source.cancel();
                    }
                    d.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap();

        assert!(task.block().unwrap_err().is_cancelled());
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(task.faults().is_empty());
        assert_eq!(done.load(Ordering::SeqCst), 51);
    }

    #[test]
    fn cancellation_from_another_thread() {
        let source = CancellationSource::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let task = WorkerBuilder::new()
            .cancellation(source.token())
            .spawn(move |token| {
                for _ in 0..500 {
                    token.checkpoint()?;
                    d.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })
            .unwrap();

        let start = Instant::now();
        while done.load(Ordering::SeqCst) < 50 {
            assert!(start.elapsed() < Duration::from_secs(30));
            thread::yield_now();
        }
        source.cancel();
        let at_cancel = done.load(Ordering::SeqCst);

        assert!(task.block().unwrap_err().is_cancelled());
        let finished = done.load(Ordering::SeqCst);
        // At most the iteration that was past its checkpoint when cancellation was requested.
        assert!(finished <= at_cancel + 1, "{finished} > {at_cancel} + 1");
        assert!(finished < 500);
    }

    #[test]
    fn requested_token_skips_spawn() {
        let source = CancellationSource::new();
        source.cancel();
        let task = WorkerBuilder::new()
            .cancellation(source.token())
            .spawn(|_| -> Result<(), Error> { panic!("must not run") })
            .unwrap();
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn failure_is_not_cancellation() {
        let task = run_on_worker(|_| -> Result<(), Error> {
            Err(Error::failure(io::Error::other("disk on fire")))
        });
        let err = task.block().unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(task.state(), TaskState::Faulted);
        assert_eq!(task.faults()[0].to_string(), "disk on fire");
    }

    #[test]
    fn panic_faults_task() {
        let task = run_on_worker(|_| -> Result<(), Error> { panic!("worker exploded") });
        match task.block().unwrap_err() {
            Error::WorkerFailure(fault) => assert!(fault.to_string().contains("worker exploded")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn named_thread() {
        let task = WorkerBuilder::new()
            .name("cruncher")
            .spawn(|_| Ok(thread::current().name().map(String::from)))
            .unwrap();
        assert_eq!(task.block().unwrap().as_deref(), Some("cruncher"));
    }
}
