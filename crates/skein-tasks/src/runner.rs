//! Default task runner
//!
//! `TasksDefault` owns a private handle arena for its thread and mutex
//! objects, a bounded due-time queue, and a fixed pool of workers. Every
//! construction step produces an RAII value, so a failure part way through
//! releases exactly what was already built, newest first.

use crate::config::TasksConfig;
use crate::objects::{TaskKind, TaskMutex, TaskObject, TaskThread};
use crate::queue::{TaskItem, TaskQueue};
use crate::worker::{Shared, WorkerPool};
use crate::{TaskFn, Tasks, ThreadEntry};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use skein_object::{
    default_allocator, Allocator, Error, Handle, HandleArena, HandleSystem, Object, Reservation,
    Result,
};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runner statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TasksStats {
    /// Worker threads running (0 after shutdown)
    pub worker_count: usize,

    /// Tasks waiting in the queue
    pub queued: usize,

    /// Maximum number of queued tasks
    pub queue_capacity: usize,

    /// Threads created and not yet joined
    pub live_threads: usize,

    /// Mutexes created and not yet destroyed
    pub live_mutexes: usize,

    /// Tasks executed so far
    pub tasks_run: u64,

    /// Tasks that returned an error or panicked
    pub tasks_failed: u64,
}

/// Resources that exist only while the runner is running
struct Running {
    pool: WorkerPool,
    _queue_memory: Reservation,
    _worker_memory: Reservation,
}

/// Owning references to every live thread and mutex
#[derive(Default)]
struct LiveObjects {
    objects: FxHashMap<Handle, Arc<TaskObject>>,
    threads: usize,
    mutexes: usize,
}

impl LiveObjects {
    fn insert(&mut self, handle: Handle, object: Arc<TaskObject>) {
        match object.kind() {
            TaskKind::Thread(_) => self.threads += 1,
            TaskKind::Mutex(_) => self.mutexes += 1,
        }
        self.objects.insert(handle, object);
    }

    fn remove(&mut self, handle: Handle) -> Option<Arc<TaskObject>> {
        let object = self.objects.remove(&handle)?;
        match object.kind() {
            TaskKind::Thread(_) => self.threads = self.threads.saturating_sub(1),
            TaskKind::Mutex(_) => self.mutexes = self.mutexes.saturating_sub(1),
        }
        Some(object)
    }

    fn is_empty(&self) -> bool {
        self.threads == 0 && self.mutexes == 0
    }
}

/// Fixed worker-pool task runner
///
/// Tasks posted with [`Tasks::task_post`] run as soon as a worker is free;
/// delayed tasks run once their due time has passed, earliest first and in
/// posting order for equal due times.
///
/// Tasks still queued when the runner shuts down are dropped without being
/// run. There is no cancellation.
pub struct TasksDefault {
    config: TasksConfig,
    allocator: Arc<dyn Allocator>,
    arena: Arc<HandleArena<TaskObject>>,
    shared: Arc<Shared>,
    lifecycle: RwLock<Option<Running>>,
    live: Mutex<LiveObjects>,
    _memory: Reservation,
}

impl TasksDefault {
    /// Create a runner backed by the system allocator
    pub fn new(config: TasksConfig) -> Result<Self> {
        Self::with_allocator(config, default_allocator())
    }

    /// Create a runner charging its memory to `allocator`
    pub fn with_allocator(config: TasksConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;

        let memory = Reservation::for_value::<TasksDefault>(&allocator)?;
        let arena = Arc::new(HandleArena::with_capacity(
            config.handle_capacity,
            Arc::clone(&allocator),
        )?);

        let queue_memory = Reservation::for_array::<TaskItem>(&allocator, config.queue_capacity)?;
        let shared = Arc::new(Shared::new(TaskQueue::with_capacity(config.queue_capacity)?));

        let mut live = LiveObjects::default();
        live.objects
            .try_reserve(config.handle_capacity)
            .map_err(|_| Error::OutOfMemory {
                requested: config.handle_capacity,
            })?;

        let worker_memory =
            Reservation::for_array::<JoinHandle<()>>(&allocator, config.worker_count)?;
        let pool = WorkerPool::spawn(&shared, config.worker_count)?;

        log::debug!(
            "task runner started: {} workers, queue capacity {}, handle capacity {}",
            config.worker_count,
            config.queue_capacity,
            config.handle_capacity
        );

        Ok(Self {
            config,
            allocator,
            arena,
            shared,
            lifecycle: RwLock::new(Some(Running {
                pool,
                _queue_memory: queue_memory,
                _worker_memory: worker_memory,
            })),
            live: Mutex::new(live),
            _memory: memory,
        })
    }

    /// Configuration the runner was built with
    pub fn config(&self) -> &TasksConfig {
        &self.config
    }

    /// Allocator the runner charges its memory to
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Check whether the runner has not been shut down
    pub fn is_running(&self) -> bool {
        self.lifecycle.read().is_some()
    }

    /// Most recent error reported by a task
    pub fn last_task_error(&self) -> Option<Error> {
        self.shared.state.lock().last_task_error.clone()
    }

    /// Take and clear the most recent task error
    pub fn take_last_task_error(&self) -> Option<Error> {
        self.shared.state.lock().last_task_error.take()
    }

    /// Snapshot of the runner's counters
    pub fn stats(&self) -> TasksStats {
        let worker_count = self
            .lifecycle
            .read()
            .as_ref()
            .map_or(0, |running| running.pool.len());
        let (queued, queue_capacity) = {
            let state = self.shared.state.lock();
            (state.queue.len(), state.queue.capacity())
        };
        let (live_threads, live_mutexes) = {
            let live = self.live.lock();
            (live.threads, live.mutexes)
        };

        TasksStats {
            worker_count,
            queued,
            queue_capacity,
            live_threads,
            live_mutexes,
            tasks_run: self.shared.tasks_run.load(Ordering::Relaxed),
            tasks_failed: self.shared.tasks_failed.load(Ordering::Relaxed),
        }
    }

    /// Join a thread and hand back what its entry returned
    ///
    /// The outer result is the join itself: once it is `Ok` the thread has
    /// exited and its handle is released, whatever the entry returned. A
    /// panicking entry yields `Panicked` in the inner result.
    pub fn thread_join_result(&self, handle: Handle) -> Result<Result<()>> {
        let object = self.arena.resolve(handle)?;
        let outcome = object.thread()?.join()?;

        object.release()?;
        self.untrack(handle);
        log::trace!("joined thread {}", handle);
        Ok(outcome)
    }

    /// Stop the workers and release the runner's resources
    ///
    /// Fails with `Busy`, tearing nothing down, while threads or mutexes
    /// created through the runner are still live. Queued tasks that have not
    /// started are dropped without running.
    pub fn shutdown(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write();
        if lifecycle.is_none() {
            return Err(Error::State("task runner already shut down"));
        }
        {
            let live = self.live.lock();
            if !live.is_empty() {
                return Err(Error::Busy("task runner has live threads or mutexes"));
            }
        }
        let Some(running) = lifecycle.take() else {
            return Err(Error::State("task runner already shut down"));
        };
        drop(lifecycle);

        self.teardown(running)
    }

    fn teardown(&self, mut running: Running) -> Result<()> {
        let mut first = running.pool.stop_and_join();

        let dropped = self.shared.state.lock().queue.take_all();
        if !dropped.is_empty() {
            log::debug!("dropping {} queued tasks on shutdown", dropped.len());
        }
        drop(dropped);

        if let Err(err) = self.arena.shutdown() {
            log::warn!("task runner arena shutdown failed: {}", err);
            if first.is_ok() {
                first = Err(err);
            }
        }

        drop(running);
        log::debug!("task runner shut down");
        first
    }

    fn ensure_running(&self) -> Result<()> {
        if self.lifecycle.read().is_none() {
            return Err(Error::State("task runner is shut down"));
        }
        Ok(())
    }

    fn enqueue(&self, task: TaskFn, due_ms: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.stopping {
            return Err(Error::State("task runner is shut down"));
        }
        state.queue.push(task, due_ms)?;
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Register a freshly built object and take ownership of it
    fn track(&self, object: Arc<TaskObject>) -> Result<Handle> {
        let handle = self.arena.register_object(&object)?;
        self.live.lock().insert(handle, object);
        Ok(handle)
    }

    fn untrack(&self, handle: Handle) {
        let removed = self.live.lock().remove(handle);
        drop(removed);
    }
}

impl Tasks for TasksDefault {
    fn thread_create(&self, entry: ThreadEntry) -> Result<Handle> {
        // Held for the whole creation so shutdown cannot interleave
        let lifecycle = self.lifecycle.read();
        if lifecycle.is_none() {
            return Err(Error::State("task runner is shut down"));
        }

        let memory = Reservation::for_value::<TaskObject>(&self.allocator)?;
        let thread = TaskThread::spawn(entry)?;
        let object = TaskObject::new(&self.arena, TaskKind::Thread(thread), memory);

        match self.track(Arc::clone(&object)) {
            Ok(handle) => {
                log::trace!("created thread {}", handle);
                Ok(handle)
            }
            Err(err) => {
                drop(lifecycle);
                // A started thread cannot be cancelled, only waited for
                if let Ok(thread) = object.thread() {
                    if let Ok(Err(entry_err)) = thread.join() {
                        log::debug!("unregistered thread finished with: {}", entry_err);
                    }
                }
                Err(err)
            }
        }
    }

    fn thread_join(&self, handle: Handle) -> Result<()> {
        if let Err(err) = self.thread_join_result(handle)? {
            log::debug!("joined thread {} finished with: {}", handle, err);
        }
        Ok(())
    }

    fn mutex_create(&self) -> Result<Handle> {
        let lifecycle = self.lifecycle.read();
        if lifecycle.is_none() {
            return Err(Error::State("task runner is shut down"));
        }

        let memory = Reservation::for_value::<TaskObject>(&self.allocator)?;
        let object = TaskObject::new(&self.arena, TaskKind::Mutex(TaskMutex::new()), memory);
        let handle = self.track(object)?;
        log::trace!("created mutex {}", handle);
        Ok(handle)
    }

    fn mutex_destroy(&self, handle: Handle) -> Result<()> {
        let object = self.arena.resolve(handle)?;
        object.mutex()?;

        object.release()?;
        self.untrack(handle);
        log::trace!("destroyed mutex {}", handle);
        Ok(())
    }

    fn mutex_lock(&self, handle: Handle) -> Result<()> {
        let object = self.arena.resolve(handle)?;
        object.mutex()?.lock(handle)
    }

    fn mutex_unlock(&self, handle: Handle) -> Result<()> {
        let object = self.arena.resolve(handle)?;
        object.mutex()?.unlock(handle)
    }

    fn sleep_ms(&self, ms: u32) -> Result<()> {
        self.ensure_running()?;
        thread::sleep(Duration::from_millis(u64::from(ms)));
        Ok(())
    }

    fn task_post(&self, task: TaskFn) -> Result<()> {
        self.enqueue(task, 0)
    }

    fn task_post_delayed(&self, task: TaskFn, delay_ms: u32) -> Result<()> {
        let due_ms = self.shared.clock.due_in(u64::from(delay_ms))?;
        self.enqueue(task, due_ms)
    }
}

impl Drop for TasksDefault {
    fn drop(&mut self) {
        let Some(running) = self.lifecycle.get_mut().take() else {
            return;
        };

        let live = self.live.get_mut();
        if !live.is_empty() {
            log::warn!(
                "task runner dropped with {} live threads and {} live mutexes",
                live.threads,
                live.mutexes
            );
            // Unjoined threads are detached; their handles become unresolvable
            for (handle, _) in live.objects.drain() {
                if let Err(err) = self.arena.unregister_object(handle) {
                    log::warn!("failed to unregister {}: {}", handle, err);
                }
            }
            live.threads = 0;
            live.mutexes = 0;
        }

        if let Err(err) = self.teardown(running) {
            log::warn!("task runner teardown failed: {}", err);
        }
    }
}

impl fmt::Debug for TasksDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TasksDefault")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_object::{ErrorKind, SystemAllocator};

    fn config(worker_count: usize, queue_capacity: usize, handle_capacity: usize) -> TasksConfig {
        TasksConfig {
            worker_count,
            queue_capacity,
            handle_capacity,
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = TasksDefault::new(config(0, 4, 4)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_stats_after_start() {
        let runner = TasksDefault::new(config(2, 8, 4)).unwrap();
        let stats = runner.stats();
        assert_eq!(stats.worker_count, 2);
        assert_eq!(stats.queue_capacity, 8);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.live_threads, 0);
        assert!(runner.is_running());
    }

    #[test]
    fn test_shutdown_twice() {
        let runner = TasksDefault::new(config(1, 4, 4)).unwrap();
        runner.shutdown().unwrap();
        assert!(!runner.is_running());
        assert_eq!(runner.stats().worker_count, 0);
        assert!(matches!(runner.shutdown(), Err(Error::State(_))));
    }

    #[test]
    fn test_operations_after_shutdown() {
        let runner = TasksDefault::new(config(1, 4, 4)).unwrap();
        runner.shutdown().unwrap();

        assert!(matches!(runner.task_post(Box::new(|| Ok(()))), Err(Error::State(_))));
        assert!(matches!(runner.mutex_create(), Err(Error::State(_))));
        assert!(matches!(
            runner.thread_create(Box::new(|| Ok(()))),
            Err(Error::State(_))
        ));
        assert!(matches!(runner.sleep_ms(1), Err(Error::State(_))));
        // The private arena is gone with the runner's resources
        assert!(matches!(
            runner.mutex_lock(Handle::new(1, 1)),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn test_memory_released_after_drop() {
        let sys = Arc::new(SystemAllocator::new());
        {
            let runner = TasksDefault::with_allocator(config(2, 16, 8), sys.clone()).unwrap();
            assert!(sys.live_bytes() > 0);
            let h = runner.mutex_create().unwrap();
            runner.mutex_destroy(h).unwrap();
        }
        assert_eq!(sys.live_bytes(), 0);
    }

    #[test]
    fn test_drop_with_live_objects() {
        let sys = Arc::new(SystemAllocator::new());
        {
            let runner = TasksDefault::with_allocator(config(1, 4, 4), sys.clone()).unwrap();
            runner.mutex_create().unwrap();
            runner.thread_create(Box::new(|| Ok(()))).unwrap();
        }
        assert_eq!(sys.live_bytes(), 0);
    }
}
