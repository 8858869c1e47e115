//! Allocator capability
//!
//! Every sized buffer skein creates (slot tables, queue buffers, worker
//! tables, object wrappers) is charged against an [`Allocator`] before the
//! backing storage exists. The charge is held by a [`Reservation`], which
//! hands the bytes back when dropped, so a constructor that fails halfway
//! releases exactly what it had reserved.

use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Memory budget consulted before every sized allocation
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Reserve `bytes` bytes
    fn alloc(&self, bytes: usize) -> Result<()>;

    /// Resize an existing reservation from `old_bytes` to `new_bytes`
    fn realloc(&self, old_bytes: usize, new_bytes: usize) -> Result<()>;

    /// Return `bytes` bytes to the budget
    fn free(&self, bytes: usize);
}

/// Default allocator: tracks live bytes against an optional limit
#[derive(Debug, Default)]
pub struct SystemAllocator {
    /// Bytes currently reserved
    live: AtomicUsize,

    /// High-water mark of `live`
    peak: AtomicUsize,

    /// Successful `alloc` calls
    allocations: AtomicUsize,

    /// Maximum live bytes (None = unlimited)
    limit: Option<usize>,
}

impl SystemAllocator {
    /// Create an unlimited allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator that refuses to hold more than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Bytes currently reserved
    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Largest number of bytes reserved at once
    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Number of successful allocations
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    fn charge(&self, bytes: usize) -> Result<()> {
        let mut current = self.live.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(bytes)
                .ok_or(Error::Overflow("allocator live byte count"))?;
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(Error::OutOfMemory { requested: bytes });
                }
            }
            match self.live.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Allocator for SystemAllocator {
    fn alloc(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("zero-sized allocation"));
        }
        self.charge(bytes)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn realloc(&self, old_bytes: usize, new_bytes: usize) -> Result<()> {
        if new_bytes == 0 {
            return Err(Error::InvalidArgument("zero-sized allocation"));
        }
        if new_bytes > old_bytes {
            self.charge(new_bytes - old_bytes)
        } else {
            self.free(old_bytes - new_bytes);
            Ok(())
        }
    }

    fn free(&self, bytes: usize) {
        // Saturate: a double free must not wrap the counter
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                Some(live.saturating_sub(bytes))
            });
    }
}

/// Create the default allocator
pub fn default_allocator() -> Arc<dyn Allocator> {
    Arc::new(SystemAllocator::new())
}

/// Compute `count * elem_size`, failing on overflow
pub fn checked_size(count: usize, elem_size: usize) -> Result<usize> {
    count
        .checked_mul(elem_size)
        .ok_or(Error::Overflow("allocation size"))
}

/// Create an empty vector with room for exactly `capacity` elements
pub fn try_vec<T>(capacity: usize) -> Result<Vec<T>> {
    let mut vec = Vec::new();
    vec.try_reserve_exact(capacity)
        .map_err(|_| Error::OutOfMemory {
            requested: capacity.saturating_mul(std::mem::size_of::<T>()),
        })?;
    Ok(vec)
}

/// Bytes charged against an allocator, returned on drop
#[derive(Debug)]
pub struct Reservation {
    allocator: Arc<dyn Allocator>,
    bytes: usize,
}

impl Reservation {
    /// Reserve `bytes` bytes
    pub fn new(allocator: &Arc<dyn Allocator>, bytes: usize) -> Result<Self> {
        allocator.alloc(bytes)?;
        Ok(Self {
            allocator: Arc::clone(allocator),
            bytes,
        })
    }

    /// Reserve space for one value of type `T`
    pub fn for_value<T>(allocator: &Arc<dyn Allocator>) -> Result<Self> {
        Self::new(allocator, std::mem::size_of::<T>().max(1))
    }

    /// Reserve space for `count` values of type `T`
    pub fn for_array<T>(allocator: &Arc<dyn Allocator>, count: usize) -> Result<Self> {
        let bytes = checked_size(count, std::mem::size_of::<T>().max(1))?;
        Self::new(allocator, bytes)
    }

    /// Number of reserved bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.allocator.free(self.bytes);
    }
}
