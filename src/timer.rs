//! The timer service behind [`delay`] and [`CancellationSource::cancel_after`].
//!
//! A single lazily-started background thread keeps a min-heap of deadlines. Nothing ever sleeps on
//! behalf of a caller: waiting for a deadline is a registration with this thread, which fires the
//! associated callback when the deadline passes.
//!
//! [`CancellationSource::cancel_after`]: crate::CancellationSource::cancel_after

use std::{
    cell::Cell,
    cmp::Ordering,
    collections::BinaryHeap,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender};
use parking_lot::Mutex;

use crate::{drop::defer, promise, CancellationToken, Error, Fault, Task};

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    /// Tie-breaker so that entries with equal deadlines fire in scheduling order.
    seq: u64,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed, so that `BinaryHeap` pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

thread_local! {
    static ON_TIMER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Inbox of the timer thread. `None` until the first timer is scheduled.
static TIMER: Mutex<Option<Sender<(Instant, Callback)>>> = parking_lot::const_mutex(None);

/// Returns `true` on the timer thread.
///
/// Every timer in the process stalls while this thread is blocked.
pub(crate) fn on_timer_thread() -> bool {
    ON_TIMER_THREAD.with(Cell::get)
}

fn spawn_timer() -> io::Result<Sender<(Instant, Callback)>> {
    let (sender, recv) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("cooperate-timer".into())
        .spawn(move || run(recv))?;
    Ok(sender)
}

fn run(recv: Receiver<(Instant, Callback)>) {
    log::trace!("timer thread starting");
    let _guard = defer(|| log::trace!("timer thread exiting"));
    ON_TIMER_THREAD.with(|on| on.set(true));

    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        let received = match heap.peek() {
            Some(Entry { deadline, .. }) => match recv.recv_deadline(*deadline) {
                Ok(new) => Some(new),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match recv.recv() {
                Ok(new) => Some(new),
                Err(_) => return,
            },
        };
        if let Some((deadline, callback)) = received {
            heap.push(Entry {
                deadline,
                seq,
                callback,
            });
            seq += 1;
        }

        let now = Instant::now();
        while heap.peek().map_or(false, |entry| entry.deadline <= now) {
            if let Some(entry) = heap.pop() {
                // Callbacks settle tasks and run cancellation observers, both of which run user
                // code. A panic there must not take the timer down with it.
                if let Err(payload) = catch_unwind(AssertUnwindSafe(entry.callback)) {
                    log::error!("timer callback {}", Fault::from_panic(payload));
                }
            }
        }
    }
}

/// Runs `callback` on the timer thread once `deadline` has passed.
///
/// Starts the timer thread on first use, and starts a new one if the previous thread has exited.
pub(crate) fn schedule<F>(deadline: Instant, callback: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let message: (Instant, Callback) = (deadline, Box::new(callback));
    let mut timer = TIMER.lock();
    let message = match &*timer {
        Some(sender) => match sender.send(message) {
            Ok(()) => return Ok(()),
            Err(SendError(message)) => {
                log::warn!("timer thread has exited, restarting it");
                message
            }
        },
        None => message,
    };

    let sender = spawn_timer()?;
    sender
        .send(message)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "timer thread has exited"))?;
    *timer = Some(sender);
    Ok(())
}

/// Returns a [`Task`] that completes after `duration` has elapsed.
///
/// No thread is blocked while waiting. The task completes on the timer thread, so continuations
/// that do not capture their context will resume there. Such continuations should be short, and
/// must not block: [`Task::block`] fails with [`Error::TimerDeadlock`] on the timer thread.
pub fn delay(duration: Duration) -> Task<()> {
    delay_with(duration, &CancellationToken::none())
}

/// Like [`delay`], but the returned task becomes cancelled as soon as `token` is requested.
///
/// If `token` is already requested, the returned task is cancelled immediately.
pub fn delay_with(duration: Duration, token: &CancellationToken) -> Task<()> {
    let (promise, task) = promise();
    promise.start();
    // Settled by whichever of the timer or the cancellation fires first.
    let slot = std::sync::Arc::new(Mutex::new(Some(promise)));

    let on_cancel = slot.clone();
    let registration = token.register(move || {
        if let Some(promise) = on_cancel.lock().take() {
            promise.cancel();
        }
    });
    if task.is_terminal() {
        return task;
    }

    let on_elapsed = slot.clone();
    let scheduled = schedule(Instant::now() + duration, move || {
        registration.unregister();
        if let Some(promise) = on_elapsed.lock().take() {
            promise.complete(());
        }
    });
    if let Err(e) = scheduled {
        if let Some(promise) = slot.lock().take() {
            promise.settle(Err(Error::failure(e)));
        }
    }
    task
}
