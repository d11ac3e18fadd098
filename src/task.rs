//! Cooperative tasks and their completion sources.
//!
//! A [`Task`] is the read side of an asynchronous operation: it can be inspected, awaited,
//! composed with [`when_all`], given continuations, or (carefully) blocked on. The write side is a
//! [`Promise`], of which exactly one exists per task. Since settling a [`Promise`] consumes it,
//! every task transitions into a terminal state exactly once.

use std::{
    fmt, mem,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    executor::{Executor, ExecutorId},
    job::Await,
    timer, Error, Fault,
};

/// Creates a connected pair of [`Promise`] and [`Task`].
///
/// The task starts out [`TaskState::Pending`] and becomes terminal when the promise is settled
/// (or dropped).
pub fn promise<T: Clone>() -> (Promise<T>, Task<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            stage: Stage::Pending,
            continuations: Vec::new(),
        }),
        condvar: Condvar::new(),
        waits_on: Mutex::new(WaitsOn::Nothing),
    });
    (
        Promise {
            inner: inner.clone(),
            settled: false,
        },
        Task { inner },
    )
}

/// Lifecycle of a [`Task`].
///
/// `Pending → Running → {Completed | Faulted | Cancelled}`. No transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Faulted,
    Cancelled,
}

impl TaskState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Faulted | TaskState::Cancelled
        )
    }
}

enum Outcome<T> {
    Completed(T),
    Faulted { first: Fault, rest: Vec<Fault> },
    Cancelled,
}

impl<T: Clone> Outcome<T> {
    fn to_result(&self) -> Result<T, Error> {
        match self {
            Outcome::Completed(value) => Ok(value.clone()),
            Outcome::Faulted { first, .. } => Err(Error::WorkerFailure(first.clone())),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

enum Stage<T> {
    Pending,
    Running,
    Done(Outcome<T>),
}

type Continuation<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

struct State<T> {
    stage: Stage<T>,
    /// Run in registration order, outside of the lock, once the task becomes terminal.
    continuations: Vec<Continuation<T>>,
}

/// What an unfinished task needs in order to make progress.
///
/// Only used to detect blocking waits that can never return.
pub(crate) enum WaitsOn {
    /// Progress does not depend on any executor.
    Nothing,
    /// The next step of the task has to run on this executor.
    Executor(ExecutorId),
    /// The task is waiting for other tasks.
    Tasks(Vec<Arc<dyn Pending>>),
}

/// Type-erased view of an unfinished task.
pub(crate) trait Pending: Send + Sync {
    /// Returns the executor that has to run queued work before this task can complete.
    fn blocked_on(&self) -> Option<ExecutorId>;

    fn set_waits_on(&self, waits_on: WaitsOn);
}

struct Inner<T> {
    state: Mutex<State<T>>,
    /// Notified once, when the task becomes terminal.
    condvar: Condvar,
    waits_on: Mutex<WaitsOn>,
}

impl<T> Inner<T> {
    fn is_done(&self) -> bool {
        matches!(self.state.lock().stage, Stage::Done(_))
    }
}

impl<T: Clone> Inner<T> {
    fn finish(&self, outcome: Outcome<T>) {
        let continuations = {
            let mut state = self.state.lock();
            if let Stage::Done(_) = state.stage {
                // Only the single `Promise` settles a task, and it can only do so once.
                return;
            }
            let continuations: Vec<_> = mem::take(&mut state.continuations)
                .into_iter()
                .map(|continuation| (continuation, outcome.to_result()))
                .collect();
            state.stage = Stage::Done(outcome);
            continuations
        };
        *self.waits_on.lock() = WaitsOn::Nothing;
        self.condvar.notify_all();

        // A panicking continuation must not starve the ones registered after it; the first panic
        // is re-raised once every continuation has run.
        let mut first_panic = None;
        for (continuation, result) in continuations {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || continuation(result))) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            // Settling from a destructor during unwinding must not panic again.
            if thread::panicking() {
                log::error!("continuation {}", Fault::from_panic(payload));
            } else {
                resume_unwind(payload);
            }
        }
    }

    /// Registers `continuation`, or hands it back if the task is already terminal.
    fn try_register(&self, continuation: Continuation<T>) -> Result<(), Continuation<T>> {
        let mut state = self.state.lock();
        match state.stage {
            Stage::Done(_) => Err(continuation),
            Stage::Pending | Stage::Running => {
                state.continuations.push(continuation);
                Ok(())
            }
        }
    }

    fn result(&self) -> Option<Result<T, Error>> {
        match &self.state.lock().stage {
            Stage::Done(outcome) => Some(outcome.to_result()),
            Stage::Pending | Stage::Running => None,
        }
    }
}

impl<T: Send + 'static> Pending for Inner<T> {
    fn blocked_on(&self) -> Option<ExecutorId> {
        if self.is_done() {
            return None;
        }
        match &*self.waits_on.lock() {
            WaitsOn::Nothing => None,
            WaitsOn::Executor(id) => Some(*id),
            WaitsOn::Tasks(tasks) => tasks.iter().find_map(|task| task.blocked_on()),
        }
    }

    fn set_waits_on(&self, waits_on: WaitsOn) {
        if !self.is_done() {
            *self.waits_on.lock() = waits_on;
        }
    }
}

/// The single writer of a [`Task`]'s outcome.
///
/// All settling methods consume the [`Promise`]. Dropping an unsettled [`Promise`] faults the task
/// with a [`PromiseDropped`] reason, so a task can never be left pending by a writer that went
/// away (for example, because the thread holding it panicked).
pub struct Promise<T: Clone> {
    inner: Arc<Inner<T>>,
    settled: bool,
}

impl<T: Clone> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.inner.finish(Outcome::Faulted {
            first: Fault::new(PromiseDropped { _priv: () }),
            rest: Vec::new(),
        });
    }
}

impl<T: Clone> Promise<T> {
    /// Moves the task from [`TaskState::Pending`] to [`TaskState::Running`].
    ///
    /// Does nothing if the task is already running.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if let Stage::Pending = state.stage {
            state.stage = Stage::Running;
        }
    }

    /// Completes the task with `value`.
    ///
    /// Continuations registered on the task run on the calling thread before this returns (unless
    /// they captured an executor, in which case they are posted to it).
    pub fn complete(self, value: T) {
        self.finish(Outcome::Completed(value));
    }

    /// Faults the task.
    pub fn fail(self, fault: Fault) {
        self.finish(Outcome::Faulted {
            first: fault,
            rest: Vec::new(),
        });
    }

    pub fn cancel(self) {
        self.finish(Outcome::Cancelled);
    }

    /// Settles the task from a [`Result`].
    ///
    /// [`Error::Cancelled`] cancels the task, [`Error::WorkerFailure`] faults it with the carried
    /// reason, and any other error faults it with the error itself as the reason.
    pub fn settle(self, result: Result<T, Error>) {
        match result {
            Ok(value) => self.complete(value),
            Err(Error::Cancelled) => self.cancel(),
            Err(Error::WorkerFailure(fault)) => self.fail(fault),
            Err(other) => self.fail(Fault::new(other)),
        }
    }

    fn fail_many(self, mut faults: Vec<Fault>) {
        if faults.is_empty() {
            return self.fail(Fault::msg("faulted without a reason"));
        }
        let first = faults.remove(0);
        self.finish(Outcome::Faulted {
            first,
            rest: faults,
        });
    }

    fn finish(mut self, outcome: Outcome<T>) {
        self.settled = true;
        self.inner.finish(outcome);
    }

    pub(crate) fn set_waits_on(&self, waits_on: WaitsOn)
    where
        T: Send + 'static,
    {
        self.inner.set_waits_on(waits_on);
    }

    pub(crate) fn pending(&self) -> Arc<dyn Pending>
    where
        T: Send + 'static,
    {
        self.inner.clone()
    }
}

/// The reason a task faults when its [`Promise`] is dropped without being settled.
#[derive(Debug, Clone, thiserror::Error)]
#[error("promise was dropped without being settled")]
pub struct PromiseDropped {
    _priv: (),
}

/// A handle to an asynchronous operation that eventually produces a `T`.
///
/// [`Task`]s are cheap to clone; all clones observe the same outcome. The result is cloned out to
/// every awaiter, which is why most methods require `T: Clone`.
///
/// Awaiting a [`Task`] directly (`task.await`) resumes on the executor the awaiting code was
/// running on. Use [`Task::configure_await`] to resume wherever the task completes instead.
pub struct Task<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Task<T> {
    /// Returns the current [`TaskState`].
    ///
    /// Once a terminal state has been observed, every later call returns the same state.
    pub fn state(&self) -> TaskState {
        match &self.inner.state.lock().stage {
            Stage::Pending => TaskState::Pending,
            Stage::Running => TaskState::Running,
            Stage::Done(Outcome::Completed(_)) => TaskState::Completed,
            Stage::Done(Outcome::Faulted { .. }) => TaskState::Faulted,
            Stage::Done(Outcome::Cancelled) => TaskState::Cancelled,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.inner.is_done()
    }

    /// Returns every fault recorded for this task, the reported reason first.
    ///
    /// A task created by [`when_all`] records the faults of all its failed inputs. Returns an empty
    /// list unless the task is [`TaskState::Faulted`].
    pub fn faults(&self) -> Vec<Fault> {
        match &self.inner.state.lock().stage {
            Stage::Done(Outcome::Faulted { first, rest }) => {
                let mut faults = Vec::with_capacity(rest.len() + 1);
                faults.push(first.clone());
                faults.extend(rest.iter().cloned());
                faults
            }
            _ => Vec::new(),
        }
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Returns an already completed task.
    pub fn completed(value: T) -> Self {
        let (promise, task) = promise();
        promise.complete(value);
        task
    }

    /// Returns an already faulted task.
    pub fn faulted(fault: Fault) -> Self {
        let (promise, task) = promise();
        promise.fail(fault);
        task
    }

    /// Returns an already cancelled task.
    pub fn cancelled() -> Self {
        let (promise, task) = promise();
        promise.cancel();
        task
    }

    /// Returns the outcome if the task is terminal, without blocking.
    pub fn try_result(&self) -> Option<Result<T, Error>> {
        self.inner.result()
    }

    /// Blocks the calling thread until the task is terminal, and returns its outcome.
    ///
    /// # Deadlocks
    ///
    /// This is the one blocking primitive in this crate, and it is a hazard: if the calling thread
    /// owns an [`Executor`], and the task can only complete after that executor runs some queued
    /// work (for example, a future spawned on it that resumes on it), the call can never return,
    /// because the one thread able to run that work is the one blocked here.
    ///
    /// When the executor was built with deadlock detection (the default in debug builds), this
    /// situation is detected before blocking and reported as [`Error::DeadlockDetected`]. On an
    /// owning thread, prefer [`Executor::run_until`], which keeps the executor running while
    /// waiting.
    ///
    /// The same goes for the timer thread, where continuations of [`delay`] tasks run when they do
    /// not capture their context. Blocking there on an unfinished task always fails with
    /// [`Error::TimerDeadlock`].
    ///
    /// [`delay`]: crate::delay
    pub fn block(&self) -> Result<T, Error> {
        self.check_deadlock()?;

        let mut state = self.inner.state.lock();
        loop {
            if let Stage::Done(outcome) = &state.stage {
                return outcome.to_result();
            }
            self.inner.condvar.wait(&mut state);
        }
    }

    /// Like [`Task::block`], but gives up after `timeout`, returning [`None`].
    pub fn block_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
        if let Err(e) = self.check_deadlock() {
            return Some(Err(e));
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Stage::Done(outcome) = &state.stage {
                return Some(outcome.to_result());
            }
            if self
                .inner
                .condvar
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &state.stage {
                    Stage::Done(outcome) => Some(outcome.to_result()),
                    Stage::Pending | Stage::Running => None,
                };
            }
        }
    }

    fn check_deadlock(&self) -> Result<(), Error> {
        if timer::on_timer_thread() && !self.is_terminal() {
            log::debug!("refusing to block the timer thread");
            return Err(Error::TimerDeadlock);
        }
        let Some(executor) = Executor::current() else {
            return Ok(());
        };
        if !executor.detects_deadlocks() {
            return Ok(());
        }
        if self.inner.blocked_on() == Some(executor.id()) {
            log::debug!(
                "refusing to block the owning thread of executor {}",
                executor.id()
            );
            return Err(Error::DeadlockDetected {
                executor: executor.id(),
            });
        }
        Ok(())
    }

    /// Runs `continuation` with the task's outcome once the task is terminal.
    ///
    /// If `capture_context` is `true` and the calling thread owns an [`Executor`], the continuation
    /// is posted to that executor. Otherwise it runs on whichever thread completes the task. If the
    /// task is already terminal, the continuation runs (or is posted) right away.
    ///
    /// A captured continuation whose executor has been torn down in the meantime is dropped and a
    /// warning is logged.
    pub fn continue_with<F>(&self, capture_context: bool, continuation: F)
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        let target = if capture_context {
            Executor::current()
        } else {
            None
        };
        let continuation: Continuation<T> = Box::new(move |result| match target {
            Some(executor) => {
                if let Err(e) = executor.post(move || continuation(result)) {
                    log::warn!("dropping continuation: {e}");
                }
            }
            None => continuation(result),
        });
        self.register(continuation);
    }

    /// Registers `continuation`, running it on the calling thread if the task is already terminal.
    fn register(&self, continuation: Continuation<T>) {
        if let Err(continuation) = self.inner.try_register(continuation) {
            if let Some(result) = self.inner.result() {
                continuation(result);
            }
        }
    }

    pub(crate) fn try_register<F>(&self, continuation: F) -> bool
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        self.inner.try_register(Box::new(continuation)).is_ok()
    }

    pub(crate) fn pending(&self) -> Arc<dyn Pending> {
        self.inner.clone()
    }

    /// Returns a future that waits for this task, resuming either on the awaiting executor
    /// (`capture_context == true`) or on whichever thread completes the task.
    ///
    /// The future resolves to the task's outcome: a fault is re-raised as
    /// [`Error::WorkerFailure`], cancellation as [`Error::Cancelled`].
    pub fn configure_await(self, capture_context: bool) -> Await<T> {
        Await::new(self, capture_context)
    }
}

impl<T: Clone + Send + 'static> std::future::IntoFuture for Task<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Await<T>;

    /// Awaits the task, capturing the current executor.
    fn into_future(self) -> Await<T> {
        self.configure_await(true)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("state", &self.state()).finish()
    }
}

/// Returns a task that becomes terminal once every task in `tasks` is terminal.
///
/// - If any input faulted, the result is [`TaskState::Faulted`]; the reported reason is the first
///   fault observed, and [`Task::faults`] lists all of them.
/// - Otherwise, if any input was cancelled, the result is [`TaskState::Cancelled`].
/// - Otherwise it completes with the inputs' values, in input order.
///
/// The result never becomes terminal before all inputs are, even when an input fails early.
pub fn when_all<T, I>(tasks: I) -> Task<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Task<T>>,
{
    struct Gather<T: Clone> {
        remaining: usize,
        values: Vec<Option<T>>,
        faults: Vec<Fault>,
        cancelled: bool,
        promise: Option<Promise<Vec<T>>>,
    }

    let tasks: Vec<Task<T>> = tasks.into_iter().collect();
    let (promise, all) = promise();
    if tasks.is_empty() {
        promise.complete(Vec::new());
        return all;
    }
    promise.start();
    promise.set_waits_on(WaitsOn::Tasks(tasks.iter().map(Task::pending).collect()));

    let gather = Arc::new(Mutex::new(Gather {
        remaining: tasks.len(),
        values: tasks.iter().map(|_| None).collect(),
        faults: Vec::new(),
        cancelled: false,
        promise: Some(promise),
    }));
    for (index, task) in tasks.iter().enumerate() {
        let gather = gather.clone();
        let child = task.clone();
        task.continue_with(false, move |result| {
            let mut g = gather.lock();
            match result {
                Ok(value) => g.values[index] = Some(value),
                Err(Error::Cancelled) => g.cancelled = true,
                Err(_) => g.faults.extend(child.faults()),
            }
            g.remaining -= 1;
            if g.remaining != 0 {
                return;
            }

            let Some(promise) = g.promise.take() else {
                return;
            };
            let faults = mem::take(&mut g.faults);
            let cancelled = g.cancelled;
            let values = mem::take(&mut g.values);
            drop(g);

            if !faults.is_empty() {
                promise.fail_many(faults);
            } else if cancelled {
                promise.cancel();
            } else {
                match values.into_iter().collect::<Option<Vec<T>>>() {
                    Some(values) => promise.complete(values),
                    None => promise.fail(Fault::msg("input task completed without a value")),
                }
            }
        });
    }
    all
}

#[cfg(test)]
mod tests {
    use std::{
        future::IntoFuture,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
    };

    use super::*;
    use crate::{run_on_worker, test::block_on};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn handles_are_send_and_sync() {
        assert_send_sync::<Task<u32>>();
        assert_send_sync::<Promise<u32>>();
    }

    #[test]
    fn state_machine() {
        let (promise, task) = promise::<u32>();
        assert_eq!(task.state(), TaskState::Pending);
        promise.start();
        assert_eq!(task.state(), TaskState::Running);
        promise.complete(7);
        for _ in 0..3 {
            assert_eq!(task.state(), TaskState::Completed);
            assert_eq!(task.try_result().unwrap().unwrap(), 7);
        }
    }

    #[test]
    fn terminal_observation_is_stable_across_threads() {
        let (promise, task) = promise::<u32>();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let task = task.clone();
                thread::spawn(move || {
                    let first = task.block().unwrap();
                    let second = task.block().unwrap();
                    (first, second, task.state())
                })
            })
            .collect();
        promise.complete(3);
        for reader in readers {
            assert_eq!(reader.join().unwrap(), (3, 3, TaskState::Completed));
        }
    }

    #[test]
    fn dropped_promise_faults() {
        let (promise, task) = promise::<()>();
        drop(promise);
        assert_eq!(task.state(), TaskState::Faulted);
        match task.block() {
            Err(Error::WorkerFailure(fault)) => {
                assert!(fault.get().downcast_ref::<PromiseDropped>().is_some())
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn settle_maps_errors() {
        let (cancelling, task) = promise::<()>();
        cancelling.settle(Err(Error::Cancelled));
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(task.block().unwrap_err().is_cancelled());

        let (failing, task) = promise::<()>();
        failing.settle(Err(Error::failure(std::fmt::Error)));
        assert_eq!(task.state(), TaskState::Faulted);
        assert_eq!(task.faults().len(), 1);
    }

    #[test]
    fn continuations_run_in_order_on_completing_thread() {
        let (promise, task) = promise::<u32>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            task.continue_with(false, move |result| {
                seen.lock().push((i, result.unwrap(), thread::current().id()));
            });
        }
        let completer = thread::spawn(move || {
            promise.complete(9);
            thread::current().id()
        })
        .join()
        .unwrap();
        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![(0, 9, completer), (1, 9, completer), (2, 9, completer)]
        );
    }

    #[test]
    fn late_continuation_runs_immediately() {
        let task = Task::completed(1u8);
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        task.continue_with(false, move |result| {
            assert_eq!(result.unwrap(), 1);
            r.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_continuation_does_not_skip_later_ones() {
        let (p, task) = promise::<u32>();
        task.continue_with(false, |_| panic!("continuation exploded"));
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        task.continue_with(false, move |result| {
            assert_eq!(result.unwrap(), 1);
            r.store(true, Ordering::SeqCst);
        });

        // The panic still reaches the completing thread, after every continuation ran.
        let completed = catch_unwind(AssertUnwindSafe(move || p.complete(1)));
        assert!(completed.is_err());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.block().unwrap(), 1);
    }

    #[test]
    fn capture_without_executor_runs_anywhere() {
        let task = Task::completed(());
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        task.continue_with(true, move |_| r.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn block_timeout_gives_up() {
        let (promise, task) = promise::<()>();
        assert!(task.block_timeout(Duration::from_millis(10)).is_none());
        promise.complete(());
        assert!(task.block_timeout(Duration::from_millis(10)).unwrap().is_ok());
    }

    #[test]
    fn await_outside_executor() {
        let (promise, task) = promise::<&'static str>();
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.complete("done");
        });
        assert_eq!(block_on(task.clone().configure_await(false)).unwrap(), "done");
        assert_eq!(block_on(task.into_future()).unwrap(), "done");
        completer.join().unwrap();
    }

    #[test]
    fn await_distinguishes_failure_from_cancellation() {
        let failed = Task::<()>::faulted(Fault::msg("nope"));
        let cancelled = Task::<()>::cancelled();
        assert!(matches!(
            block_on(failed.into_future()),
            Err(Error::WorkerFailure(_))
        ));
        assert!(matches!(
            block_on(cancelled.into_future()),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn when_all_completes_in_input_order() {
        let tasks = (0..5u64).map(|i| {
            run_on_worker(move |_| {
                thread::sleep(Duration::from_millis(25 - i * 5));
                Ok(i)
            })
        });
        let all = when_all(tasks);
        assert_eq!(all.block().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn when_all_empty_completes() {
        let all = when_all(Vec::<Task<u8>>::new());
        assert_eq!(all.try_result().unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn when_all_fault_waits_for_everything() {
        let side_effects = Arc::new(AtomicUsize::new(0));
        let slow = |effects: Arc<AtomicUsize>| {
            run_on_worker(move |_| {
                thread::sleep(Duration::from_millis(50));
                effects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let a = slow(side_effects.clone());
        let b = run_on_worker(|_| -> Result<(), Error> { Err(Error::failure(std::fmt::Error)) });
        let c = slow(side_effects.clone());

        let all = when_all([a.clone(), b.clone(), c.clone()]);
        let err = all.block().unwrap_err();
        assert_eq!(all.state(), TaskState::Faulted);
        assert!(a.is_terminal() && c.is_terminal());
        assert_eq!(side_effects.load(Ordering::SeqCst), 2);

        match err {
            Error::WorkerFailure(reported) => assert!(reported.ptr_eq(&b.faults()[0])),
            other => panic!("expected a worker failure, got {other:?}"),
        }
    }

    #[test]
    fn when_all_keeps_every_fault() {
        let (p1, t1) = promise::<()>();
        let (p2, t2) = promise::<()>();
        let (p3, t3) = promise::<()>();
        let all = when_all([t1, t2, t3]);
        p2.fail(Fault::msg("second"));
        p3.cancel();
        assert!(!all.is_terminal());
        p1.fail(Fault::msg("first"));

        assert_eq!(all.state(), TaskState::Faulted);
        let faults: Vec<String> = all.faults().iter().map(ToString::to_string).collect();
        // The first fault *observed* is reported.
        assert_eq!(faults, vec!["second", "first"]);
    }

    #[test]
    fn when_all_cancelled_without_faults() {
        let all = when_all([Task::completed(1), Task::cancelled(), Task::completed(2)]);
        assert_eq!(all.state(), TaskState::Cancelled);
        assert!(all.block().unwrap_err().is_cancelled());
    }
}
