use std::collections::HashSet;
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::NativeError;
use crate::mark::{self, MarkSink, Marker};
use crate::object::{DataCell, DataMarkFn, ManagedObject, ObjectKind};
use crate::value::NativeAddress;

/// Mask of the type tag in [`NativeHeader::flags`].
pub const T_MASK: usize = 0x1f;
/// Set on a resource referenced from native memory during the current pass.
pub const FL_MARKED: usize = 1 << 10;

/// Layout of every resource handed out by [`MallocAllocator`].
///
/// Native code reads `flags & T_MASK` for the type and, for data objects,
/// `data` for the wrapped struct pointer.
#[repr(C)]
#[derive(Debug)]
pub struct NativeHeader {
    /// Type tag and flag bits.
    pub flags: usize,
    /// Identity of the managed object.
    pub object_id: u64,
    /// Wrapped struct for data objects, null otherwise.
    pub data: *mut c_void,
    /// Mark routine of the wrapped struct.
    pub dmark: Option<DataMarkFn>,
    cell: *const DataCell,
}

/// `calloc`-backed allocator laying out a [`NativeHeader`] per resource.
#[derive(Debug, Default)]
pub struct MallocAllocator {
    live: Mutex<HashSet<usize>>,
}

impl MallocAllocator {
    /// Creates an allocator with no live resources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources not yet freed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn header(&self, address: NativeAddress) -> Option<*mut NativeHeader> {
        self.live
            .lock()
            .contains(&address.as_raw())
            .then(|| address.as_raw() as *mut NativeHeader)
    }

    /// Reads the header flags of a live resource.
    #[must_use]
    pub fn flags(&self, address: NativeAddress) -> Option<usize> {
        // SAFETY: `header` only returns live allocations made by `allocate`.
        self.header(address).map(|header| unsafe { (*header).flags })
    }

    /// Returns `true` if the resource was marked during the current pass.
    #[must_use]
    pub fn is_marked(&self, address: NativeAddress) -> bool {
        self.flags(address).is_some_and(|flags| flags & FL_MARKED != 0)
    }

    /// Returns the wrapped struct of a data resource.
    #[must_use]
    pub fn data_ptr(&self, address: NativeAddress) -> Option<*mut c_void> {
        // SAFETY: see `flags`.
        let data = self.header(address).map(|header| unsafe { (*header).data })?;
        (!data.is_null()).then_some(data)
    }

    fn set_flag(&self, address: NativeAddress, flag: usize, on: bool) {
        if let Some(header) = self.header(address) {
            // SAFETY: live allocation; flags are only written under the GIL.
            unsafe {
                if on {
                    (*header).flags |= flag;
                } else {
                    (*header).flags &= !flag;
                }
            }
        }
    }

    /// # Safety
    ///
    /// `header` must come from `allocate` and not have been released.
    unsafe fn release(header: *mut NativeHeader) {
        // SAFETY: caller contract.
        unsafe {
            let cell = (*header).cell;
            if !cell.is_null() {
                drop(Arc::from_raw(cell));
            }
            libc::free(header.cast::<c_void>());
        }
    }
}

impl super::NativeAllocator for MallocAllocator {
    fn allocate(&self, kind: ObjectKind, object: &ManagedObject) -> Result<NativeAddress, NativeError> {
        let bytes = size_of::<NativeHeader>();
        // SAFETY: plain C allocation; null is handled below.
        let header = unsafe { libc::calloc(1, bytes) }.cast::<NativeHeader>();
        if header.is_null() {
            return Err(NativeError::OutOfMemory { bytes });
        }

        let (data, dmark, cell) = object.data_cell().map_or(
            (ptr::null_mut(), None, ptr::null()),
            |cell| (cell.as_ptr(), cell.data_type().mark, Arc::into_raw(Arc::clone(cell))),
        );
        // SAFETY: `header` is a fresh, zeroed allocation of the right size.
        unsafe {
            header.write(NativeHeader {
                flags: kind.as_raw() as usize & T_MASK,
                object_id: object.id().get(),
                data,
                dmark,
                cell,
            });
        }

        let address = NativeAddress::from_raw(header as usize);
        self.live.lock().insert(address.as_raw());
        Ok(address)
    }

    fn free(&self, address: NativeAddress) -> Result<(), NativeError> {
        if !self.live.lock().remove(&address.as_raw()) {
            return Err(NativeError::UnknownAddress(address));
        }
        // SAFETY: the address was live and is now unlisted, so this is the
        // only release.
        unsafe { Self::release(address.as_raw() as *mut NativeHeader) };
        Ok(())
    }

    fn mark_owned_references(&self, address: NativeAddress, marker: &Marker<'_>) {
        let Some(header) = self.header(address) else {
            return;
        };
        // SAFETY: live allocation.
        let cell = unsafe { (*header).cell };
        if cell.is_null() {
            return;
        }
        let flagging = FlaggingSink {
            allocator: self,
            inner: *marker,
        };
        let flagging_marker = Marker::new(&flagging);
        mark::with_marker(&flagging_marker, || {
            // SAFETY: the header holds a strong count on the cell.
            unsafe { (*cell).mark() };
        });
    }

    fn clear_mark(&self, address: NativeAddress) {
        self.set_flag(address, FL_MARKED, false);
    }
}

impl Drop for MallocAllocator {
    fn drop(&mut self) {
        for raw in self.live.get_mut().drain() {
            // SAFETY: every listed address is a live allocation.
            unsafe { Self::release(raw as *mut NativeHeader) };
        }
    }
}

/// Forwards marks to the pass and flags the target header.
struct FlaggingSink<'a> {
    allocator: &'a MallocAllocator,
    inner: Marker<'a>,
}

impl MarkSink for FlaggingSink<'_> {
    fn mark_address(&self, address: NativeAddress) -> bool {
        let newly = self.inner.mark(address);
        self.allocator.set_flag(address, FL_MARKED, true);
        newly
    }

    fn mark_object(&self, object: &ManagedObject) -> bool {
        self.inner.mark_object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeAllocator;

    #[test]
    fn test_header_carries_kind_and_id() {
        let allocator = MallocAllocator::new();
        let object = ManagedObject::new(ObjectKind::String);
        let address = allocator.allocate(object.kind(), &object).unwrap();

        assert!(address.is_resource());
        assert_eq!(allocator.flags(address).map(|f| f & T_MASK), Some(0x05));
        assert_eq!(allocator.live_count(), 1);
        assert!(allocator.data_ptr(address).is_none());

        allocator.free(address).unwrap();
        assert_eq!(allocator.live_count(), 0);
        assert!(matches!(allocator.free(address), Err(NativeError::UnknownAddress(_))));
    }

    #[test]
    fn test_data_resource_shares_cell() {
        struct Empty;
        impl crate::Mark for Empty {
            fn mark(&self, _marker: &Marker<'_>) {}
        }

        let allocator = MallocAllocator::new();
        let object = ManagedObject::wrap_data(DataCell::boxed(Empty));
        let address = allocator.allocate(object.kind(), &object).unwrap();
        let cell = object.data_cell().unwrap();
        assert_eq!(Arc::strong_count(cell), 2);
        assert_eq!(allocator.data_ptr(address), Some(cell.as_ptr()));

        allocator.free(address).unwrap();
        assert_eq!(Arc::strong_count(object.data_cell().unwrap()), 1);
    }
}
