//! The native allocator collaborator.
//!
//! The bridge never touches native memory itself. Everything it needs from
//! the native side goes through [`NativeAllocator`]: allocate a resource for
//! an object, free it, enumerate the references an owning resource holds,
//! and clear per-pass mark bookkeeping.
//!
//! Two implementations ship with the crate:
//!
//! - [`MallocAllocator`] lays out a C-compatible object header with `calloc`.
//! - [`RecordingAllocator`] hands out synthetic addresses and records every
//!   call, with fault injection for tests and diagnostics.

mod malloc;
mod recording;

pub use malloc::{MallocAllocator, NativeHeader, FL_MARKED, T_MASK};
pub use recording::{Fault, RecordingAllocator};

use crate::error::NativeError;
use crate::mark::Marker;
use crate::object::{ManagedObject, ObjectKind};
use crate::value::NativeAddress;

/// Native-side resource management.
///
/// Every method is called with the GIL held.
pub trait NativeAllocator: Send + Sync {
    /// Allocates the native resource representing `object`.
    ///
    /// The returned address must be non-zero, 8-byte aligned and distinct
    /// from every address not yet freed.
    ///
    /// # Errors
    ///
    /// [`NativeError::OutOfMemory`] when native memory is exhausted.
    fn allocate(&self, kind: ObjectKind, object: &ManagedObject) -> Result<NativeAddress, NativeError>;

    /// Releases the resource at `address`. Called exactly once per address.
    ///
    /// # Errors
    ///
    /// Any failure of the native free routine.
    fn free(&self, address: NativeAddress) -> Result<(), NativeError>;

    /// Reports, through `marker`, every managed object the resource at
    /// `address` references.
    ///
    /// `marker` is also installed as the active marker, so native mark
    /// routines may report through the `gc_mark` upcall instead.
    fn mark_owned_references(&self, address: NativeAddress, marker: &Marker<'_>);

    /// Clears the "marked this pass" flag of the resource at `address`.
    fn clear_mark(&self, address: NativeAddress) {
        let _ = address;
    }
}
