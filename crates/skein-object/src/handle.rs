//! Generational handle tokens

use std::fmt;

/// Opaque `(id, generation)` token referencing a slot in a handle arena
///
/// `id` is a 1-based slot index. `generation` changes every time the slot is
/// reused, so a handle captured before reuse never resolves to the new
/// occupant. A handle with either field zero is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle {
    id: u32,
    generation: u32,
}

impl Handle {
    /// The canonical empty handle
    pub const NULL: Handle = Handle {
        id: 0,
        generation: 0,
    };

    /// Create a handle from raw parts
    pub const fn new(id: u32, generation: u32) -> Self {
        Self { id, generation }
    }

    /// 1-based slot identifier
    #[inline]
    pub fn id(self) -> u32 {
        self.id
    }

    /// Slot generation this handle was issued for
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Check whether the handle is structurally valid (both fields non-zero)
    #[inline]
    pub fn is_valid(self) -> bool {
        self.id != 0 && self.generation != 0
    }

    /// Pack into a single `u64` (id in the high half)
    #[inline]
    pub fn to_bits(self) -> u64 {
        (u64::from(self.id) << 32) | u64::from(self.generation)
    }

    /// Unpack a value produced by [`Handle::to_bits`]
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            id: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.id, self.generation)
    }
}
