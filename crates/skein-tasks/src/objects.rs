//! Handle-managed thread and mutex objects
//!
//! Both live in the runner's private arena. The runner keeps the owning
//! `Arc` while the handle is live; the arena only holds a `Weak`.

use crate::ThreadEntry;
use parking_lot::{Condvar, Mutex};
use skein_object::{
    Error, Handle, HandleArena, HandleSystem, Object, ObjectHeader, Reservation, Result,
};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Type id of thread objects
pub const THREAD_TYPE_ID: u32 = 1;

/// Type id of mutex objects
pub const MUTEX_TYPE_ID: u32 = 2;

/// A native thread started through the runner
pub struct TaskThread {
    /// Taken by the (single) joiner
    join: Mutex<Option<JoinHandle<Result<()>>>>,
    joined: AtomicBool,
}

impl TaskThread {
    /// Start `entry` on a new native thread
    ///
    /// The entry's result, or its panic, is returned by [`TaskThread::join`].
    pub(crate) fn spawn(entry: ThreadEntry) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("skein-thread".to_string())
            .spawn(move || {
                panic::catch_unwind(AssertUnwindSafe(entry))
                    .unwrap_or_else(|payload| Err(Error::from_panic(payload)))
            })?;
        Ok(Self {
            join: Mutex::new(Some(handle)),
            joined: AtomicBool::new(false),
        })
    }

    /// Check whether the thread has been joined
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    /// Wait for the thread to exit
    ///
    /// The outer result reports whether the join itself was allowed; the
    /// inner one is what the entry returned.
    pub(crate) fn join(&self) -> Result<Result<()>> {
        if self.is_joined() {
            return Err(Error::State("thread already joined"));
        }
        let handle = self
            .join
            .lock()
            .take()
            .ok_or(Error::State("thread join already in progress"))?;

        let outcome = handle
            .join()
            .unwrap_or_else(|payload| Err(Error::from_panic(payload)));
        self.joined.store(true, Ordering::Release);
        Ok(outcome)
    }
}

impl fmt::Debug for TaskThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskThread")
            .field("joined", &self.is_joined())
            .finish()
    }
}

#[derive(Debug, Default)]
struct MutexState {
    locked: bool,
    destroyed: bool,
}

/// A mutex created through the runner
///
/// Lock ownership is not tracked: any thread may unlock it.
#[derive(Debug, Default)]
pub struct TaskMutex {
    state: Mutex<MutexState>,
    released: Condvar,
}

impl TaskMutex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Check whether the mutex is currently held
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Block until the mutex is acquired
    pub(crate) fn lock(&self, handle: Handle) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.destroyed {
                return Err(Error::NotFound(handle));
            }
            if !state.locked {
                break;
            }
            self.released.wait(&mut state);
        }
        state.locked = true;
        Ok(())
    }

    pub(crate) fn unlock(&self, handle: Handle) -> Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::NotFound(handle));
        }
        if !state.locked {
            return Err(Error::State("mutex is not locked"));
        }
        state.locked = false;
        self.released.notify_one();
        Ok(())
    }

    /// Mark the mutex destroyed; refused while it is held
    fn retire(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.locked {
            return Err(Error::Busy("mutex is locked"));
        }
        state.destroyed = true;
        self.released.notify_all();
        Ok(())
    }
}

/// What a [`TaskObject`] wraps
#[derive(Debug)]
pub enum TaskKind {
    /// A native thread
    Thread(TaskThread),

    /// A mutex
    Mutex(TaskMutex),
}

/// A thread or mutex registered in the runner's arena
pub struct TaskObject {
    header: ObjectHeader,
    arena: Weak<HandleArena<TaskObject>>,
    kind: TaskKind,
    _memory: Reservation,
}

impl TaskObject {
    pub(crate) fn new(
        arena: &Arc<HandleArena<TaskObject>>,
        kind: TaskKind,
        memory: Reservation,
    ) -> Arc<Self> {
        let type_id = match kind {
            TaskKind::Thread(_) => THREAD_TYPE_ID,
            TaskKind::Mutex(_) => MUTEX_TYPE_ID,
        };
        Arc::new(Self {
            header: ObjectHeader::new(type_id, 0),
            arena: Arc::downgrade(arena),
            kind,
            _memory: memory,
        })
    }

    /// The wrapped primitive
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// The wrapped thread, if this is one
    pub fn as_thread(&self) -> Option<&TaskThread> {
        match &self.kind {
            TaskKind::Thread(thread) => Some(thread),
            TaskKind::Mutex(_) => None,
        }
    }

    /// The wrapped mutex, if this is one
    pub fn as_mutex(&self) -> Option<&TaskMutex> {
        match &self.kind {
            TaskKind::Mutex(mutex) => Some(mutex),
            TaskKind::Thread(_) => None,
        }
    }

    pub(crate) fn thread(&self) -> Result<&TaskThread> {
        self.as_thread()
            .ok_or(Error::Unsupported("handle does not refer to a thread"))
    }

    pub(crate) fn mutex(&self) -> Result<&TaskMutex> {
        self.as_mutex()
            .ok_or(Error::Unsupported("handle does not refer to a mutex"))
    }
}

impl Object for TaskObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn destroy(&self) -> Result<()> {
        match &self.kind {
            TaskKind::Thread(thread) => {
                if !thread.is_joined() {
                    return Err(Error::State("thread not joined"));
                }
            }
            TaskKind::Mutex(mutex) => mutex.retire()?,
        }

        if let Some(arena) = self.arena.upgrade() {
            let handle = self.header.handle();
            if handle.is_valid() {
                arena.unregister_object(handle)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TaskObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskObject")
            .field("header", &self.header)
            .field("kind", &self.kind)
            .finish()
    }
}
