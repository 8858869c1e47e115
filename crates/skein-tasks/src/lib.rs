//! Skein task runner
//!
//! A bounded worker pool with a due-time ordered queue, plus threads and
//! mutexes handed out as generational handles:
//! - `task_post` / `task_post_delayed` for background work
//! - `thread_create` / `thread_join` for dedicated native threads
//! - `mutex_*` for cross-thread mutual exclusion
//!
//! # Example
//!
//! ```no_run
//! use skein_tasks::{Tasks, TasksConfig, TasksDefault};
//!
//! let runner = TasksDefault::new(TasksConfig::default())?;
//! runner.task_post(Box::new(|| {
//!     log::info!("hello from a worker");
//!     Ok(())
//! }))?;
//! # Ok::<(), skein_tasks::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod objects;
pub mod queue;
pub mod runner;
mod worker;

pub use config::{ConfigError, TasksConfig};
pub use objects::{TaskKind, TaskMutex, TaskObject, TaskThread, MUTEX_TYPE_ID, THREAD_TYPE_ID};
pub use queue::{Clock, TaskItem, TaskQueue};
pub use runner::{TasksDefault, TasksStats};
pub use skein_object::{Error, ErrorKind, Handle, Result};

/// A task body; its error is recorded as the runner's last task error
pub type TaskFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A thread entry; its result is returned by `thread_join`
pub type ThreadEntry = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Task runner capability table
pub trait Tasks: Send + Sync {
    /// Start `entry` on a new native thread
    fn thread_create(&self, entry: ThreadEntry) -> Result<Handle>;

    /// Wait for a thread to exit and release its handle
    ///
    /// Succeeds once the thread has exited and its handle is released,
    /// whatever the entry returned. Fails with `State` if the thread is
    /// already being joined.
    fn thread_join(&self, handle: Handle) -> Result<()>;

    /// Create an unlocked mutex
    fn mutex_create(&self) -> Result<Handle>;

    /// Destroy a mutex; fails with `Busy` while it is locked
    fn mutex_destroy(&self, handle: Handle) -> Result<()>;

    /// Block until the mutex is acquired
    fn mutex_lock(&self, handle: Handle) -> Result<()>;

    /// Release the mutex; fails with `State` if it is not locked
    fn mutex_unlock(&self, handle: Handle) -> Result<()>;

    /// Sleep the calling thread
    fn sleep_ms(&self, ms: u32) -> Result<()>;

    /// Queue a task to run as soon as a worker is free
    ///
    /// Fails with `Busy` when the queue is full; never blocks.
    fn task_post(&self, task: TaskFn) -> Result<()>;

    /// Queue a task to run once `delay_ms` milliseconds have passed
    fn task_post_delayed(&self, task: TaskFn, delay_ms: u32) -> Result<()>;
}
