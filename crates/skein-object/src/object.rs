//! Reference-counted object header and lifecycle protocol
//!
//! Every handle-managed object embeds an [`ObjectHeader`] and implements
//! [`Object`]. The header's reference count decides when the object is
//! destroyed; the arena only looks objects up and never owns them.

use crate::{Error, Handle, Result};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Header embedded in every handle-managed object
pub struct ObjectHeader {
    /// Handle assigned by the arena (packed, NULL while unregistered)
    handle: AtomicU64,

    /// Runtime type identifier
    type_id: u32,

    /// Implementation-defined flags
    flags: u32,

    /// Outstanding references; zero only while destroying or after
    ref_count: AtomicU32,
}

impl ObjectHeader {
    /// Create a header holding the caller's initial reference
    pub fn new(type_id: u32, flags: u32) -> Self {
        Self {
            handle: AtomicU64::new(Handle::NULL.to_bits()),
            type_id,
            flags,
            ref_count: AtomicU32::new(1),
        }
    }

    /// Handle currently assigned to this object
    #[inline]
    pub fn handle(&self) -> Handle {
        Handle::from_bits(self.handle.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.to_bits(), Ordering::Release);
    }

    /// Runtime type identifier
    #[inline]
    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    /// Implementation-defined flags
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Current reference count
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Add a reference
    ///
    /// Fails with `State` once the object has been destroyed and with
    /// `Overflow` when the count is saturated.
    pub fn retain(&self) -> Result<()> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(Error::State("retain on destroyed object"));
            }
            if current == u32::MAX {
                return Err(Error::Overflow("object reference count"));
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("handle", &self.handle())
            .field("type_id", &self.type_id)
            .field("flags", &self.flags)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Lifecycle operations of a handle-managed object
pub trait Object: Send + Sync {
    /// The embedded header
    fn header(&self) -> &ObjectHeader;

    /// Tear the object down once its last reference is released
    ///
    /// Implementations registered with an arena are expected to unregister
    /// their own handle here. Returning an error leaves the object alive.
    fn destroy(&self) -> Result<()>;

    /// Add a reference
    fn retain(&self) -> Result<()> {
        self.header().retain()
    }

    /// Drop a reference, destroying the object when it was the last one
    fn release(&self) -> Result<()> {
        release_object(self)
    }

    /// Runtime type identifier
    fn object_type(&self) -> u32 {
        self.header().type_id()
    }
}

/// Drop one reference to `object`
///
/// The count reaches zero before `destroy` runs, so a retain racing with
/// destruction fails instead of reviving the object. If `destroy` fails the
/// count is restored to one and the error is returned.
pub fn release_object<O: Object + ?Sized>(object: &O) -> Result<()> {
    let header = object.header();
    let mut current = header.ref_count.load(Ordering::Acquire);
    loop {
        if current == 0 {
            return Err(Error::State("release on destroyed object"));
        }
        let next = current - 1;
        match header.ref_count.compare_exchange_weak(
            current,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) if next > 0 => return Ok(()),
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }

    if let Err(err) = object.destroy() {
        header.ref_count.store(1, Ordering::Release);
        return Err(err);
    }
    Ok(())
}
