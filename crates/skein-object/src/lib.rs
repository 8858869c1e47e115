//! Skein object system
//!
//! This crate provides the handle layer shared by every skein subsystem:
//! - Generational handles (`Handle`) instead of raw pointers
//! - Reference-counted object headers and the `Object` lifecycle trait
//! - A capacity-bounded handle arena with stale-handle detection
//! - The allocator capability every sized buffer is charged against

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod arena;
pub mod error;
pub mod handle;
pub mod object;

pub use alloc::{default_allocator, Allocator, Reservation, SystemAllocator};
pub use arena::{HandleArena, HandleSystem};
pub use error::{Error, ErrorKind, Result};
pub use handle::Handle;
pub use object::{release_object, Object, ObjectHeader};
