//! Bounded task queue ordered by due time
//!
//! The queue is an unordered array: the earliest due task is found with a
//! linear scan on every pick and removed by swapping the last entry into its
//! place. Capacities are small, so this beats maintaining a heap.

use crate::TaskFn;
use skein_object::alloc::try_vec;
use skein_object::{Error, Handle, Result};
use std::fmt;
use std::time::Instant;

/// A queued task
pub struct TaskItem {
    /// Task body
    pub task: TaskFn,

    /// Milliseconds since the runner's epoch at which the task becomes due
    pub due_ms: u64,

    /// Insertion order, breaks ties between equal due times
    pub seq: u64,
}

impl fmt::Debug for TaskItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskItem")
            .field("due_ms", &self.due_ms)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Monotonic millisecond clock
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Start a clock at zero
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock started
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Due time `delay_ms` from now
    ///
    /// The current time is rounded up, so a task is never picked before its
    /// full delay has passed.
    pub fn due_in(&self, delay_ms: u64) -> Result<u64> {
        let elapsed = self.epoch.elapsed();
        let partial = u128::from(elapsed.subsec_nanos() % 1_000_000 != 0);
        let now = u64::try_from(elapsed.as_millis() + partial).unwrap_or(u64::MAX);
        now.checked_add(delay_ms)
            .ok_or(Error::Overflow("task due time"))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity queue of pending tasks
pub struct TaskQueue {
    items: Vec<TaskItem>,
    capacity: usize,
    next_seq: u64,
}

impl TaskQueue {
    /// Create an empty queue holding at most `capacity` tasks
    ///
    /// The backing buffer is allocated up front; pushes never reallocate.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("zero queue capacity"));
        }
        Ok(Self {
            items: try_vec(capacity)?,
            capacity,
            next_seq: 0,
        })
    }

    /// Number of queued tasks
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check whether the queue is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of queued tasks
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a task due at `due_ms`
    ///
    /// Fails with `Busy` when the queue is full; callers are never blocked.
    pub fn push(&mut self, task: TaskFn, due_ms: u64) -> Result<()> {
        if self.items.len() >= self.capacity {
            return Err(Error::Busy("task queue full"));
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.items.push(TaskItem { task, due_ms, seq });
        Ok(())
    }

    /// Remove and return the earliest task that is due at `now_ms`
    ///
    /// Fails with `NotFound` when the queue is empty and with `NotReady`
    /// carrying the remaining wait when the earliest task is not yet due.
    pub fn pick(&mut self, now_ms: u64) -> Result<TaskItem> {
        let index = self
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| (item.due_ms, item.seq))
            .map(|(index, _)| index)
            .ok_or(Error::NotFound(Handle::NULL))?;

        let due_ms = self.items[index].due_ms;
        if now_ms < due_ms {
            return Err(Error::NotReady {
                wait_ms: due_ms - now_ms,
            });
        }
        Ok(self.items.swap_remove(index))
    }

    /// Remove every queued task without running it
    ///
    /// The queue keeps its capacity limit but gives up its buffer; this is
    /// meant for teardown once no more tasks will be pushed.
    pub fn take_all(&mut self) -> Vec<TaskItem> {
        std::mem::take(&mut self.items)
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.items.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_object::ErrorKind;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> TaskFn {
        let log = Arc::clone(log);
        Box::new(move || {
            log.lock().unwrap().push(value);
            Ok(())
        })
    }

    fn run(item: TaskItem) {
        (item.task)().unwrap();
    }

    #[test]
    fn test_pick_empty() {
        let mut queue = TaskQueue::with_capacity(2).unwrap();
        assert_eq!(queue.pick(0).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            TaskQueue::with_capacity(0).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_push_full_is_busy() {
        let mut queue = TaskQueue::with_capacity(2).unwrap();
        queue.push(Box::new(|| Ok(())), 0).unwrap();
        queue.push(Box::new(|| Ok(())), 0).unwrap();
        assert!(matches!(
            queue.push(Box::new(|| Ok(())), 0),
            Err(Error::Busy(_))
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_not_ready_reports_wait() {
        let mut queue = TaskQueue::with_capacity(4).unwrap();
        queue.push(Box::new(|| Ok(())), 150).unwrap();
        queue.push(Box::new(|| Ok(())), 400).unwrap();

        assert_eq!(queue.pick(100).unwrap_err(), Error::NotReady { wait_ms: 50 });
        assert_eq!(queue.len(), 2);

        let item = queue.pick(150).unwrap();
        assert_eq!(item.due_ms, 150);
        assert_eq!(queue.pick(150).unwrap_err(), Error::NotReady { wait_ms: 250 });
    }

    #[test]
    fn test_picks_in_due_time_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TaskQueue::with_capacity(8).unwrap();
        for due in [30u32, 10, 50, 20, 40] {
            queue.push(recorder(&log, due), u64::from(due)).unwrap();
        }

        while let Ok(item) = queue.pick(1_000) {
            run(item);
        }
        assert_eq!(*log.lock().unwrap(), vec![10, 20, 30, 40, 50]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_equal_due_times_are_fifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TaskQueue::with_capacity(8).unwrap();
        for value in 0..6 {
            queue.push(recorder(&log, value), 0).unwrap();
        }

        // Swap-removal reorders the buffer; sequence numbers keep FIFO
        while let Ok(item) = queue.pick(0) {
            run(item);
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_take_all_drops_tasks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TaskQueue::with_capacity(4).unwrap();
        queue.push(recorder(&log, 1), 0).unwrap();
        queue.push(recorder(&log, 2), 10).unwrap();

        let dropped = queue.take_all();
        assert_eq!(dropped.len(), 2);
        assert!(queue.is_empty());
        drop(dropped);
        assert!(log.lock().unwrap().is_empty());
        // The captured Arc was released with the task
        assert_eq!(Arc::strong_count(&log), 1);
    }

    #[test]
    fn test_clock_due_overflow() {
        let clock = Clock {
            epoch: Instant::now().checked_sub(Duration::from_millis(5)).unwrap(),
        };
        assert!(clock.now_ms() >= 5);
        assert!(clock.due_in(10).unwrap() >= 15);
        assert_eq!(clock.due_in(u64::MAX).unwrap_err().kind(), ErrorKind::Overflow);
    }
}
