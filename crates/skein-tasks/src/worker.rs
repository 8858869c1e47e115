//! Worker threads draining the shared task queue
//!
//! Workers hold the queue mutex while deciding what to run and release it
//! while running, so a long task never stalls the rest of the pool. A task
//! that fails or panics only updates the runner's last error.

use crate::queue::{Clock, TaskItem, TaskQueue};
use parking_lot::{Condvar, Mutex};
use skein_object::alloc::try_vec;
use skein_object::{Error, Result};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State guarded by the queue mutex
pub(crate) struct QueueState {
    /// Pending tasks
    pub queue: TaskQueue,

    /// Set once teardown starts; workers exit and posts are refused
    pub stopping: bool,

    /// Most recent error reported by a task
    pub last_task_error: Option<Error>,
}

/// State shared between the runner and its workers
pub(crate) struct Shared {
    /// Queue, stop flag and last error
    pub state: Mutex<QueueState>,

    /// Signalled on every post and on stop
    pub cond: Condvar,

    /// Time base for due times
    pub clock: Clock,

    /// Tasks executed (successful or not)
    pub tasks_run: AtomicU64,

    /// Tasks that returned an error or panicked
    pub tasks_failed: AtomicU64,
}

impl Shared {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue,
                stopping: false,
                last_task_error: None,
            }),
            cond: Condvar::new(),
            clock: Clock::new(),
            tasks_run: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
        }
    }

    /// Tell every worker to exit
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        self.cond.notify_all();
    }

    /// Block until a task is due, or return None once stopping
    fn next_task(&self) -> Option<TaskItem> {
        let mut state = self.state.lock();
        loop {
            if state.stopping {
                return None;
            }
            match state.queue.pick(self.clock.now_ms()) {
                Ok(item) => return Some(item),
                Err(Error::NotFound(_)) => self.cond.wait(&mut state),
                Err(Error::NotReady { wait_ms }) => {
                    // A timeout only means it is time to look again
                    self.cond.wait_for(&mut state, Duration::from_millis(wait_ms));
                }
                Err(err) => {
                    log::error!("task queue failed, stopping runner: {}", err);
                    state.stopping = true;
                    state.last_task_error = Some(err);
                    self.cond.notify_all();
                    return None;
                }
            }
        }
    }

    fn run(&self, item: TaskItem) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(item.task))
            .unwrap_or_else(|payload| Err(Error::from_panic(payload)));

        self.tasks_run.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = outcome {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
            log::debug!("task {} failed: {}", item.seq, err);
            self.state.lock().last_task_error = Some(err);
        }
    }
}

fn worker_loop(shared: &Shared) {
    while let Some(item) = shared.next_task() {
        shared.run(item);
    }
    log::trace!("worker {:?} exiting", thread::current().name());
}

type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

/// The runner's worker threads
///
/// Dropping the pool stops and joins every worker it started, which is what
/// unwinds a partially spawned pool.
pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers named `skein-worker-{n}`
    pub fn spawn(shared: &Arc<Shared>, count: usize) -> Result<Self> {
        Self::spawn_with(shared, count, |_, builder, body| builder.spawn(body))
    }

    /// Spawn through `spawn_thread`; workers started before a failure are
    /// stopped and joined when the partial pool drops
    fn spawn_with<F>(shared: &Arc<Shared>, count: usize, mut spawn_thread: F) -> Result<Self>
    where
        F: FnMut(usize, thread::Builder, WorkerBody) -> io::Result<JoinHandle<()>>,
    {
        let mut pool = Self {
            shared: Arc::clone(shared),
            handles: try_vec(count)?,
        };

        for id in 0..count {
            let worker_shared = Arc::clone(shared);
            let builder = thread::Builder::new().name(format!("skein-worker-{}", id));
            let handle = spawn_thread(id, builder, Box::new(move || worker_loop(&worker_shared)))
                .map_err(|err| {
                    log::warn!("failed to spawn worker {}: {}", id, err);
                    Error::from(err)
                })?;
            pool.handles.push(handle);
        }

        log::debug!("spawned {} task workers", count);
        Ok(pool)
    }

    /// Number of running workers
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Stop every worker and wait for it to exit
    ///
    /// Returns the first worker panic, after joining all of them.
    pub fn stop_and_join(&mut self) -> Result<()> {
        self.shared.stop();

        let current = thread::current().id();
        let mut first = Ok(());
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                // Last runner reference dropped by one of its own tasks
                log::warn!("worker pool stopped from a worker; detaching it");
                continue;
            }
            if let Err(payload) = handle.join() {
                let err = Error::from_panic(payload);
                log::warn!("worker panicked: {}", err);
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        first
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            if let Err(err) = self.stop_and_join() {
                log::warn!("worker pool teardown: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn shared(capacity: usize) -> Arc<Shared> {
        Arc::new(Shared::new(TaskQueue::with_capacity(capacity).unwrap()))
    }

    fn post(shared: &Shared, due_ms: u64, task: crate::TaskFn) {
        let mut state = shared.state.lock();
        state.queue.push(task, due_ms).unwrap();
        shared.cond.notify_one();
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_pool_runs_tasks() {
        let shared = shared(8);
        let mut pool = WorkerPool::spawn(&shared, 2).unwrap();
        assert_eq!(pool.len(), 2);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            post(
                &shared,
                0,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 5));
        pool.stop_and_join().unwrap();
        assert_eq!(pool.len(), 0);
        assert_eq!(shared.tasks_run.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_failures_are_recorded_not_fatal() {
        let shared = shared(8);
        let _pool = WorkerPool::spawn(&shared, 1).unwrap();

        post(&shared, 0, Box::new(|| Err(Error::Task("first".to_string()))));
        post(
            &shared,
            0,
            Box::new(|| -> Result<()> { panic!("second") }),
        );
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        post(
            &shared,
            0,
            Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(wait_until(Duration::from_secs(2), || ran.load(Ordering::SeqCst) == 1));
        assert_eq!(shared.tasks_failed.load(Ordering::Relaxed), 2);
        assert_eq!(
            shared.state.lock().last_task_error,
            Some(Error::Panicked("second".to_string()))
        );
    }

    #[test]
    fn test_stop_wakes_idle_and_sleeping_workers() {
        let shared = shared(4);
        let mut pool = WorkerPool::spawn(&shared, 3).unwrap();

        // One far-future task keeps a worker in a timed wait
        post(&shared, u64::MAX / 2, Box::new(|| Ok(())));
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        pool.stop_and_join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(shared.state.lock().stopping);
        assert_eq!(shared.state.lock().queue.len(), 1);
    }

    #[test]
    fn test_spawn_failure_joins_started_workers() {
        let shared = shared(4);
        let started = Arc::new(AtomicUsize::new(0));

        let result = WorkerPool::spawn_with(&shared, 4, |id, builder, body| {
            if id == 2 {
                return Err(io::Error::new(io::ErrorKind::Other, "thread limit reached"));
            }
            started.fetch_add(1, Ordering::SeqCst);
            builder.spawn(body)
        });

        assert!(matches!(result, Err(Error::Platform(_))));
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert!(shared.state.lock().stopping);
        // Both started workers exited and dropped their references
        assert_eq!(Arc::strong_count(&shared), 1);
    }

    #[test]
    fn test_drop_joins_workers() {
        let shared = shared(4);
        {
            let _pool = WorkerPool::spawn(&shared, 2).unwrap();
        }
        assert!(shared.state.lock().stopping);
        // Only the test's reference remains once workers have exited
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
