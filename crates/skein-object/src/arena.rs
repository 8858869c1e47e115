//! Capacity-bounded generational handle arena
//!
//! Slots are recycled through an intrusive free list, so registration,
//! lookup and removal are all O(1). Every removal bumps the slot's
//! generation, which permanently invalidates handles issued before it.

use crate::alloc::{checked_size, try_vec, Allocator, Reservation};
use crate::{Error, Handle, Object, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// End-of-list marker for `next_free`
const FREE_LIST_END: u32 = u32::MAX;

/// Handle arena capability table
pub trait HandleSystem<T: ?Sized>: Send + Sync {
    /// Allocate the slot table
    fn init(&self, capacity: usize) -> Result<()>;

    /// Free the slot table; fails while objects are still registered
    fn shutdown(&self) -> Result<()>;

    /// Assign a handle to `object` and record a non-owning reference to it
    fn register_object(&self, object: &Arc<T>) -> Result<Handle>;

    /// Release a handle's slot and invalidate the handle
    fn unregister_object(&self, handle: Handle) -> Result<()>;

    /// Look up the object behind a handle
    fn resolve(&self, handle: Handle) -> Result<Arc<T>>;

    /// Resolve and add a reference to the object
    fn retain(&self, handle: Handle) -> Result<()>;

    /// Resolve and drop a reference from the object
    fn release(&self, handle: Handle) -> Result<()>;

    /// Number of registered objects
    fn live_count(&self) -> usize;

    /// Number of slots (0 while uninitialised)
    fn capacity(&self) -> usize;
}

struct Slot<T: ?Sized> {
    /// Registered object (Some iff the slot is allocated)
    object: Option<Weak<T>>,

    /// Generation of the current or next occupant; never zero
    generation: u32,

    /// Next slot in the free list
    next_free: u32,
}

struct SlotTable<T: ?Sized> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    live_count: usize,
    _memory: Reservation,
}

impl<T: ?Sized> SlotTable<T> {
    /// Map a handle to its occupied slot index
    fn locate(&self, handle: Handle) -> Result<usize> {
        if !handle.is_valid() {
            return Err(Error::InvalidArgument("null handle"));
        }
        let index = (handle.id() - 1) as usize;
        match self.slots.get(index) {
            Some(slot) if slot.object.is_some() && slot.generation == handle.generation() => {
                Ok(index)
            }
            _ => Err(Error::NotFound(handle)),
        }
    }
}

/// Default [`HandleSystem`] implementation
///
/// The arena holds only `Weak` references: registering an object does not
/// keep it alive. The slot table lock is never held while calling into an
/// object, so an object's `destroy` may unregister itself re-entrantly.
pub struct HandleArena<T: ?Sized> {
    allocator: Arc<dyn Allocator>,
    table: Mutex<Option<SlotTable<T>>>,
}

impl<T: Object + ?Sized> HandleArena<T> {
    /// Create an uninitialised arena
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            table: Mutex::new(None),
        }
    }

    /// Create an arena and initialise it with `capacity` slots
    pub fn with_capacity(capacity: usize, allocator: Arc<dyn Allocator>) -> Result<Self> {
        let arena = Self::new(allocator);
        arena.init(capacity)?;
        Ok(arena)
    }

    /// Check whether the slot table is allocated
    pub fn is_initialized(&self) -> bool {
        self.table.lock().is_some()
    }

    /// Allocator the slot table is charged against
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    fn lookup(&self, handle: Handle) -> Result<Arc<T>> {
        let weak = {
            let guard = self.table.lock();
            let table = guard
                .as_ref()
                .ok_or(Error::State("handle arena not initialized"))?;
            let index = table.locate(handle)?;
            table.slots[index].object.clone()
        };
        weak.and_then(|weak| weak.upgrade())
            .ok_or(Error::NotFound(handle))
    }
}

impl<T: Object + ?Sized> HandleSystem<T> for HandleArena<T> {
    fn init(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("zero arena capacity"));
        }
        checked_size(capacity, std::mem::size_of::<Slot<T>>())?;
        if capacity > u32::MAX as usize {
            return Err(Error::OutOfRange(capacity));
        }

        let mut guard = self.table.lock();
        if guard.is_some() {
            return Err(Error::State("handle arena already initialized"));
        }

        let memory = Reservation::for_array::<Slot<T>>(&self.allocator, capacity)?;
        let mut slots = try_vec(capacity)?;
        for index in 0..capacity {
            let next_free = if index + 1 < capacity {
                (index + 1) as u32
            } else {
                FREE_LIST_END
            };
            slots.push(Slot {
                object: None,
                generation: 1,
                next_free,
            });
        }

        *guard = Some(SlotTable {
            slots,
            free_head: 0,
            live_count: 0,
            _memory: memory,
        });
        log::debug!("handle arena initialized with {} slots", capacity);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let table = {
            let mut guard = self.table.lock();
            let table = guard
                .as_ref()
                .ok_or(Error::State("handle arena not initialized"))?;
            if table.live_count != 0 {
                return Err(Error::Busy("handle arena has live objects"));
            }
            guard.take()
        };
        drop(table);
        log::debug!("handle arena shut down");
        Ok(())
    }

    fn register_object(&self, object: &Arc<T>) -> Result<Handle> {
        let header = object.header();
        let mut guard = self.table.lock();
        let table = guard
            .as_mut()
            .ok_or(Error::State("handle arena not initialized"))?;
        // Checked under the lock so racing registrations of one object serialise
        if header.handle().is_valid() {
            return Err(Error::State("object already registered"));
        }
        if table.free_head == FREE_LIST_END {
            return Err(Error::Busy("handle arena exhausted"));
        }

        let index = table.free_head as usize;
        let slot = &mut table.slots[index];
        table.free_head = slot.next_free;
        slot.next_free = FREE_LIST_END;
        slot.object = Some(Arc::downgrade(object));

        let handle = Handle::new(index as u32 + 1, slot.generation);
        table.live_count += 1;
        header.set_handle(handle);

        log::trace!("registered object type {} as {}", header.type_id(), handle);
        Ok(handle)
    }

    fn unregister_object(&self, handle: Handle) -> Result<()> {
        let weak = {
            let mut guard = self.table.lock();
            let table = guard
                .as_mut()
                .ok_or(Error::State("handle arena not initialized"))?;
            let index = table.locate(handle)?;
            if table.live_count == 0 {
                return Err(Error::State("handle arena live count underflow"));
            }

            let free_head = table.free_head;
            let slot = &mut table.slots[index];
            let weak = slot.object.take();
            slot.generation = slot.generation.wrapping_add(1);
            if slot.generation == 0 {
                slot.generation = 1;
            }
            slot.next_free = free_head;
            table.free_head = index as u32;
            table.live_count -= 1;
            weak
        };

        // Upgrade outside the lock: dropping the temporary may run the
        // object's Drop, which is free to touch the arena
        if let Some(object) = weak.and_then(|weak| weak.upgrade()) {
            let header = object.header();
            if header.handle() == handle {
                header.set_handle(Handle::NULL);
            }
        }

        log::trace!("unregistered {}", handle);
        Ok(())
    }

    fn resolve(&self, handle: Handle) -> Result<Arc<T>> {
        self.lookup(handle)
    }

    fn retain(&self, handle: Handle) -> Result<()> {
        let object = self.lookup(handle)?;
        object.retain()
    }

    fn release(&self, handle: Handle) -> Result<()> {
        let object = self.lookup(handle)?;
        object.release()
    }

    fn live_count(&self) -> usize {
        self.table.lock().as_ref().map_or(0, |table| table.live_count)
    }

    fn capacity(&self) -> usize {
        self.table.lock().as_ref().map_or(0, |table| table.slots.len())
    }
}

impl<T: ?Sized> fmt::Debug for HandleArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.table.lock();
        let (capacity, live_count) = guard
            .as_ref()
            .map_or((0, 0), |table| (table.slots.len(), table.live_count));
        f.debug_struct("HandleArena")
            .field("capacity", &capacity)
            .field("live_count", &live_count)
            .finish()
    }
}
