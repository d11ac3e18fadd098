//! Futures spawned onto an [`Executor`], and the [`Await`] suspension point.
//!
//! A spawned future is the "logical caller" of the tasks it awaits. It is first polled on its
//! executor; every time it suspends on an [`Await`], the resumption is registered as a
//! continuation of the awaited task, which either posts the next poll back to the executor the
//! future was running on (context capture), or polls it inline on the thread that completed the
//! task.

use std::{
    cell::RefCell,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Wake, Waker},
};

use parking_lot::Mutex;

use crate::{
    drop::defer,
    executor::{Executor, WeakExecutor},
    promise,
    task::{Pending, WaitsOn},
    Error, Fault, Task,
};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

thread_local! {
    /// The job being polled on this thread, if any.
    static CURRENT_JOB: RefCell<Option<Arc<Job>>> = const { RefCell::new(None) };
}

pub(crate) struct Job {
    /// `None` once the future has completed (or was dropped because it could not be resumed).
    future: Mutex<Option<BoxFuture>>,
    /// The executor the future was spawned on. Wakeups from foreign futures are posted here.
    ///
    /// Weak, since queued polls of this job are owned by that executor.
    home: WeakExecutor,
    task: Arc<dyn Pending>,
    /// Set by [`Await`] when the current poll suspended on a task.
    suspended_on_task: AtomicBool,
}

impl Job {
    fn current() -> Option<Arc<Job>> {
        CURRENT_JOB.with(|current| current.borrow().clone())
    }

    fn run(self: Arc<Self>) {
        let mut slot = match self.future.try_lock() {
            Some(slot) => slot,
            // Woken and pumped from inside its own poll; try again on the next pump.
            None if Job::current().map_or(false, |current| Arc::ptr_eq(&current, &self)) => {
                return self.clone().reschedule();
            }
            // Being resumed on another thread right now.
            None => self.future.lock(),
        };
        let Some(future) = slot.as_mut() else {
            return;
        };

        let previous = CURRENT_JOB.with(|current| current.replace(Some(self.clone())));
        let _restore = defer(move || CURRENT_JOB.with(|current| *current.borrow_mut() = previous));

        self.task.set_waits_on(match Executor::current() {
            Some(executor) => WaitsOn::Executor(executor.id()),
            None => WaitsOn::Nothing,
        });
        self.suspended_on_task.store(false, Ordering::Relaxed);

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => *slot = None,
            Poll::Pending => {
                if !self.suspended_on_task.load(Ordering::Relaxed) {
                    // Suspended on some other future; its waker posts to `home`.
                    self.task.set_waits_on(WaitsOn::Executor(self.home.id()));
                }
            }
        }
    }

    /// Posts the next poll to `executor`.
    ///
    /// If that is impossible because the executor is gone, the future is dropped, which faults the
    /// spawned task.
    fn schedule_on(self: Arc<Self>, target: &WeakExecutor) {
        let Some(executor) = target.upgrade() else {
            log::warn!("dropping spawned future: executor {} is gone", target.id());
            return self.abandon();
        };
        let job = self.clone();
        if let Err(e) = executor.post(move || job.run()) {
            log::warn!("dropping spawned future: {e}");
            self.abandon();
        }
    }

    fn reschedule(self: Arc<Self>) {
        let home = self.home.clone();
        self.schedule_on(&home);
    }

    fn abandon(&self) {
        let future = self.future.lock().take();
        drop(future);
    }
}

impl Wake for Job {
    fn wake(self: Arc<Self>) {
        self.reschedule();
    }
}

/// Polls the wrapped future, turning a panic into a [`Error::WorkerFailure`].
struct CatchPanic<F>(Pin<Box<F>>);

impl<T, F: Future<Output = Result<T, Error>>> Future for CatchPanic<F> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match catch_unwind(AssertUnwindSafe(|| self.0.as_mut().poll(cx))) {
            Ok(poll) => poll,
            Err(payload) => Poll::Ready(Err(Error::WorkerFailure(Fault::from_panic(payload)))),
        }
    }
}

impl Executor {
    /// Spawns `future` as a logical caller running on this executor.
    ///
    /// The first poll is posted to the executor, so nothing runs until the owning thread pumps it.
    /// Whenever the future awaits a [`Task`], it resumes on this executor if it awaited with
    /// context capture (the default for `task.await`), or on the thread that completed the task
    /// otherwise (`task.configure_await(false).await`).
    ///
    /// The returned [`Task`] settles with the future's output; `Err(Error::Cancelled)` makes it
    /// cancelled rather than faulted. A panic in the future faults the task.
    ///
    /// Fails with [`Error::PostAfterTeardown`] if the executor has been shut down.
    pub fn spawn<T, F>(&self, future: F) -> Result<Task<T>, Error>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (promise, task) = promise();
        promise.set_waits_on(WaitsOn::Executor(self.id()));
        let job = Arc::new(Job {
            future: Mutex::new(None),
            home: self.downgrade(),
            task: promise.pending(),
            suspended_on_task: AtomicBool::new(false),
        });

        let body = async move {
            promise.start();
            let result = CatchPanic(Box::pin(future)).await;
            promise.settle(result);
        };
        *job.future.lock() = Some(Box::pin(body));

        self.post(move || job.run())?;
        Ok(task)
    }
}

/// Future returned by [`Task::configure_await`] and by awaiting a [`Task`] directly.
///
/// Resolves to the task's outcome. Inside a future spawned with [`Executor::spawn`], the
/// resumption follows the capture setting. Awaited anywhere else, it simply wakes its waker.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Await<T> {
    task: Task<T>,
    capture_context: bool,
    /// Waker slot used when awaited outside of a spawned future.
    waker: Option<Arc<Mutex<Waker>>>,
    registered: bool,
}

impl<T> Await<T> {
    pub(crate) fn new(task: Task<T>, capture_context: bool) -> Self {
        Self {
            task,
            capture_context,
            waker: None,
            registered: false,
        }
    }
}

impl<T: Clone + Send + 'static> Future for Await<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.task.try_result() {
            return Poll::Ready(result);
        }

        if self.registered {
            if let Some(slot) = &self.waker {
                slot.lock().clone_from(cx.waker());
            }
            return Poll::Pending;
        }

        match Job::current() {
            Some(job) => {
                let target = if self.capture_context {
                    Executor::current().map(|executor| executor.downgrade())
                } else {
                    None
                };
                let waits_on = match &target {
                    Some(executor) => WaitsOn::Executor(executor.id()),
                    None => WaitsOn::Tasks(vec![self.task.pending()]),
                };
                let resumed = job.clone();
                let registered = self.task.try_register(move |_| match target {
                    Some(executor) => resumed.schedule_on(&executor),
                    None => resumed.run(),
                });
                if !registered {
                    // Completed in the meantime.
                    return self.poll(cx);
                }
                job.suspended_on_task.store(true, Ordering::Relaxed);
                job.task.set_waits_on(waits_on);
            }
            None => {
                let slot = Arc::new(Mutex::new(cx.waker().clone()));
                let wake = slot.clone();
                if !self.task.try_register(move |_| wake.lock().wake_by_ref()) {
                    return self.poll(cx);
                }
                self.waker = Some(slot);
            }
        }
        self.registered = true;
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::IntoFuture,
        thread::{self, ThreadId},
        time::Duration,
    };

    use super::*;
    use crate::{delay, run_on_worker, ExecutorId, TaskState};

    fn detecting() -> Executor {
        Executor::builder()
            .name("test")
            .deadlock_detection(true)
            .build()
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Location {
        thread: ThreadId,
        executor: Option<ExecutorId>,
    }

    fn here() -> Location {
        Location {
            thread: thread::current().id(),
            executor: Executor::current().map(|e| e.id()),
        }
    }

    /// Spawns a future that awaits a task completed by another thread, and reports where it was
    /// before and after the suspension.
    fn resume_location(capture_context: bool) -> (Location, Location, ThreadId) {
        let executor = detecting();
        let (promise, input) = promise::<u32>();
        let job = executor
            .spawn(async move {
                let before = here();
                let value = input.configure_await(capture_context).await?;
                assert_eq!(value, 5);
                Ok::<_, Error>((before, here()))
            })
            .unwrap();

        // Run the future up to its suspension point.
        executor.run_pending_work().unwrap();
        assert!(!job.is_terminal());

        let completer = thread::spawn(move || {
            promise.complete(5);
            thread::current().id()
        })
        .join()
        .unwrap();

        let (before, after) = executor.run_until(&job).unwrap();
        (before, after, completer)
    }

    #[test]
    fn captured_await_resumes_on_executor() {
        let (before, after, _) = resume_location(true);
        assert_eq!(before, after);
        assert_eq!(after.thread, thread::current().id());
        assert!(after.executor.is_some());
    }

    #[test]
    fn uncaptured_await_resumes_on_completing_thread() {
        let (before, after, completer) = resume_location(false);
        assert_eq!(before.thread, thread::current().id());
        assert!(before.executor.is_some());
        assert_eq!(after.thread, completer);
        assert_eq!(after.executor, None);
    }

    #[test]
    fn await_of_completed_task_does_not_suspend() {
        let executor = detecting();
        let job = executor
            .spawn(async {
                let before = here();
                Task::completed(1).configure_await(false).await?;
                Ok::<_, Error>(before == here())
            })
            .unwrap();
        assert!(executor.run_until(&job).unwrap());
    }

    #[test]
    fn awaiting_delay_keeps_executor_responsive() {
        let executor = detecting();
        let job = executor
            .spawn(async {
                delay(Duration::from_millis(50)).await?;
                Ok::<_, Error>("woke")
            })
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        executor
            .post(move || r.store(true, Ordering::SeqCst))
            .unwrap();

        // Both the first poll and the unrelated work run; the future is parked on the timer.
        assert_eq!(executor.run_pending_work().unwrap(), 2);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(job.state(), TaskState::Running);

        assert_eq!(executor.run_until(&job).unwrap(), "woke");
    }

    #[test]
    fn blocking_on_captured_continuation_is_detected() {
        let executor = detecting();
        let job = executor
            .spawn(async {
                delay(Duration::from_millis(20)).await?;
                Ok::<_, Error>(())
            })
            .unwrap();

        // Not started yet: its first poll is queued on this executor.
        assert!(matches!(
            job.block(),
            Err(Error::DeadlockDetected { executor: id }) if id == executor.id()
        ));

        executor.run_pending_work().unwrap();
        assert!(matches!(
            job.block_timeout(Duration::from_secs(10)),
            Some(Err(Error::DeadlockDetected { .. }))
        ));

        // Pumping instead of blocking lets it finish.
        executor.run_until(&job).unwrap();
        assert_eq!(job.block().unwrap(), ());
    }

    #[test]
    fn uncaptured_continuation_can_be_blocked_on() {
        let executor = detecting();
        let job = executor
            .spawn(async {
                delay(Duration::from_millis(20)).configure_await(false).await?;
                Ok::<_, Error>(thread::current().id())
            })
            .unwrap();
        executor.run_pending_work().unwrap();

        let resumed_on = job.block().unwrap();
        assert_ne!(resumed_on, thread::current().id());
    }

    #[test]
    fn deadlock_seen_through_when_all() {
        let executor = detecting();
        let job = executor
            .spawn(async {
                delay(Duration::from_millis(10)).await?;
                Ok::<_, Error>(1)
            })
            .unwrap();
        let all = crate::when_all([Task::completed(0), job]);
        assert!(matches!(all.block(), Err(Error::DeadlockDetected { .. })));
        assert_eq!(executor.run_until(&all).unwrap(), vec![0, 1]);
    }

    #[test]
    fn deadlock_detection_can_be_disabled() {
        let executor = Executor::builder().deadlock_detection(false).build();
        let job = executor.spawn(async { Ok(()) }).unwrap();
        assert!(job.block_timeout(Duration::from_millis(20)).is_none());
        executor.run_until(&job).unwrap();
    }

    #[test]
    fn blocking_elsewhere_is_not_a_deadlock() {
        let executor = detecting();
        let job = executor
            .spawn(async {
                delay(Duration::from_millis(10)).await?;
                Ok::<_, Error>(2)
            })
            .unwrap();

        let waiter = {
            let job = job.clone();
            thread::spawn(move || job.block())
        };
        assert_eq!(executor.run_until(&job).unwrap(), 2);
        assert_eq!(waiter.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn failures_and_cancellation_propagate() {
        let executor = detecting();
        let job = executor
            .spawn(async {
                let failing = run_on_worker(|_| -> Result<u8, Error> {
                    Err(Error::failure(std::fmt::Error))
                });
                let err = failing.await.unwrap_err();
                assert!(matches!(err, Error::WorkerFailure(_)));

                Task::<u8>::cancelled().into_future().await
            })
            .unwrap();
        assert!(executor.run_until(&job).unwrap_err().is_cancelled());
        assert_eq!(job.state(), TaskState::Cancelled);
    }

    fn explode() -> Result<(), Error> {
        panic!("spawned future panicked");
    }

    #[test]
    fn panicking_future_faults_its_task() {
        let executor = detecting();
        let job = executor.spawn(async { explode() }).unwrap();
        let err = executor.run_until(&job).unwrap_err();
        assert_eq!(job.state(), TaskState::Faulted);
        assert!(err.to_string().contains("spawned future panicked"));
    }

    #[test]
    fn spawn_after_teardown_fails() {
        let executor = detecting();
        executor.shutdown();
        assert!(matches!(
            executor.spawn(async { Ok(()) }),
            Err(Error::PostAfterTeardown(_))
        ));
    }

    #[test]
    fn teardown_before_resumption_faults_the_task() {
        let executor = detecting();
        let (promise, input) = promise::<()>();
        let job = executor
            .spawn(async move { input.await })
            .unwrap();
        executor.run_pending_work().unwrap();

        executor.shutdown();
        promise.complete(());
        assert_eq!(job.state(), TaskState::Faulted);
    }

    #[test]
    fn dropping_executor_releases_queued_jobs() {
        let executor = detecting();
        let job = executor.spawn(async { Ok(()) }).unwrap();
        let home = executor.downgrade();

        // The queued first poll must not keep the executor alive.
        drop(executor);
        assert!(home.upgrade().is_none());
        assert!(Executor::current().is_none());
        assert_eq!(job.state(), TaskState::Faulted);
    }

    #[test]
    fn resuming_on_dropped_executor_faults_the_task() {
        let executor = detecting();
        let (p, input) = promise::<()>();
        let job = executor.spawn(async move { input.await }).unwrap();
        executor.run_pending_work().unwrap();

        drop(executor);
        p.complete(());
        assert_eq!(job.state(), TaskState::Faulted);
    }
}
