//! Single-threaded executors, cooperative tasks, progress reporting and cancellation.
//!
//! This library models the classic "UI thread plus background workers" setup: one thread owns some
//! state and must never block, while expensive work runs on other threads and reports back.
//!
//! # Overview
//!
//! ## Executors
//!
//! An [`Executor`] is a serial execution context owned by the thread that created it. Any thread
//! can [`post`] closures to it, but they only run when the owning thread pumps the queue, via
//! [`Executor::run_pending_work`] or [`Executor::run_until`]. Work posted to one executor runs one
//! item at a time, in posting order.
//!
//! ## Tasks
//!
//! A [`Task`] is the handle to an asynchronous operation's eventual outcome: a value, a fault, or
//! cancellation. Tasks are created by [`run_on_worker`], [`delay`], [`when_all`],
//! [`Executor::spawn`], or manually from a [`promise`].
//!
//! Tasks are awaited from `async` code spawned onto an executor. By default, awaiting a task
//! *captures the context*: the code after the `.await` resumes on the executor it was running on,
//! so it can keep touching executor-owned state. [`Task::configure_await`] opts out of that.
//!
//! ## Progress and cancellation
//!
//! [`Progress`] lets a worker report values to a callback that runs on a fixed executor.
//! [`CancellationSource`] and [`CancellationToken`] implement cooperative cancellation: workers
//! poll their token at checkpoints and stop with [`Error::Cancelled`] when asked to.
//!
//! # Usage
//!
//! ```
//! use cooperate::{CancellationSource, Error, Executor, Progress, WorkerBuilder};
//!
//! let executor = Executor::new();
//! let source = CancellationSource::new();
//!
//! let owner = executor.clone();
//! let progress = Progress::new(&executor, move |_percent: u32| {
//!     assert!(owner.is_owning_context());
//! });
//!
//! let token = source.token();
//! let job = executor.spawn(async move {
//!     let sum = WorkerBuilder::new()
//!         .name("summer")
//!         .cancellation(token)
//!         .spawn(move |token| {
//!             let mut sum = 0u64;
//!             for i in 1..=100 {
//!                 token.checkpoint()?;
//!                 sum += i;
//!                 progress.report(i as u32)?;
//!             }
//!             Ok(sum)
//!         })
//!         .map_err(Error::failure)?
//!         .await?;
//!     // Resumed on the executor.
//!     Ok::<_, Error>(sum * 2)
//! }).unwrap();
//!
//! assert_eq!(executor.run_until(&job).unwrap(), 10100);
//! executor.run_pending_work().unwrap();
//! ```
//!
//! [`post`]: Executor::post

mod cancel;
mod drop;
mod error;
mod executor;
mod job;
mod progress;
mod task;
mod timer;
mod worker;

pub use cancel::{CancellationSource, CancellationToken, Registration};
pub use error::{Error, Fault};
pub use executor::{Executor, ExecutorBuilder, ExecutorId};
pub use job::Await;
pub use progress::Progress;
pub use task::{promise, when_all, Promise, PromiseDropped, Task, TaskState};
pub use timer::{delay, delay_with};
pub use worker::{run_on_worker, WorkerBuilder};
