//! Deterministic allocator that records every call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::NativeError;
use crate::mark::Marker;
use crate::object::{DataCell, ManagedObject, ObjectId, ObjectKind};
use crate::value::NativeAddress;

const FIRST_ADDRESS: usize = 0x1000;
const ADDRESS_STEP: usize = 0x10;

/// Failure injected into [`RecordingAllocator::free`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fault {
    /// `free` returns [`NativeError::FreeFailed`].
    Error,
    /// `free` panics.
    Panic,
}

struct Resource {
    kind: ObjectKind,
    object_id: ObjectId,
    cell: Option<Arc<DataCell>>,
    references: Vec<NativeAddress>,
}

#[derive(Default)]
struct State {
    next_address: usize,
    live: HashMap<NativeAddress, Resource>,
    allocations: usize,
    free_calls: HashMap<NativeAddress, usize>,
    freed: Vec<NativeAddress>,
    cleared: Vec<NativeAddress>,
    mark_calls: usize,
    fail_allocations: usize,
    misalign_next: bool,
    faults: HashMap<NativeAddress, Fault>,
}

/// Allocator handing out synthetic, never-reused addresses.
///
/// Addresses start at `0x1000` and grow by 16, so a freed address is never
/// handed out again. References reported by
/// [`mark_owned_references`](crate::native::NativeAllocator::mark_owned_references)
/// are whatever [`set_references`](Self::set_references) configured, plus the
/// mark routine of a wrapped data struct.
#[derive(Default)]
pub struct RecordingAllocator {
    state: Mutex<State>,
}

impl RecordingAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` allocations fail with [`NativeError::OutOfMemory`].
    pub fn fail_next_allocations(&self, n: usize) {
        self.state.lock().fail_allocations = n;
    }

    /// Makes the next allocation return an address inside the immediate space.
    pub fn misalign_next_allocation(&self) {
        self.state.lock().misalign_next = true;
    }

    /// Makes `free(address)` fail.
    pub fn inject_free_fault(&self, address: NativeAddress, fault: Fault) {
        self.state.lock().faults.insert(address, fault);
    }

    /// Sets the addresses the resource at `owner` references.
    pub fn set_references(&self, owner: NativeAddress, references: Vec<NativeAddress>) {
        if let Some(resource) = self.state.lock().live.get_mut(&owner) {
            resource.references = references;
        }
    }

    /// Number of successful allocations.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.state.lock().allocations
    }

    /// Number of `free` calls for `address`, including failed ones.
    #[must_use]
    pub fn free_count(&self, address: NativeAddress) -> usize {
        self.state.lock().free_calls.get(&address).copied().unwrap_or(0)
    }

    /// Total number of `free` calls.
    #[must_use]
    pub fn total_frees(&self) -> usize {
        self.state.lock().free_calls.values().sum()
    }

    /// Addresses passed to `free`, in call order.
    #[must_use]
    pub fn freed(&self) -> Vec<NativeAddress> {
        self.state.lock().freed.clone()
    }

    /// Number of resources not yet freed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Returns `true` if `address` was allocated and not freed.
    #[must_use]
    pub fn is_live(&self, address: NativeAddress) -> bool {
        self.state.lock().live.contains_key(&address)
    }

    /// Kind and object of a live resource.
    #[must_use]
    pub fn resource(&self, address: NativeAddress) -> Option<(ObjectKind, ObjectId)> {
        self.state
            .lock()
            .live
            .get(&address)
            .map(|resource| (resource.kind, resource.object_id))
    }

    /// Addresses passed to `clear_mark`, in call order.
    #[must_use]
    pub fn cleared_marks(&self) -> Vec<NativeAddress> {
        self.state.lock().cleared.clone()
    }

    /// Number of `mark_owned_references` calls.
    #[must_use]
    pub fn mark_calls(&self) -> usize {
        self.state.lock().mark_calls
    }
}

impl super::NativeAllocator for RecordingAllocator {
    fn allocate(&self, kind: ObjectKind, object: &ManagedObject) -> Result<NativeAddress, NativeError> {
        let mut state = self.state.lock();
        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(NativeError::OutOfMemory { bytes: ADDRESS_STEP });
        }
        if state.next_address == 0 {
            state.next_address = FIRST_ADDRESS;
        }
        let mut raw = state.next_address;
        state.next_address += ADDRESS_STEP;
        if std::mem::take(&mut state.misalign_next) {
            raw |= 0x4;
        }
        let address = NativeAddress::from_raw(raw);
        state.live.insert(
            address,
            Resource {
                kind,
                object_id: object.id(),
                cell: object.data_cell().cloned(),
                references: Vec::new(),
            },
        );
        state.allocations += 1;
        Ok(address)
    }

    fn free(&self, address: NativeAddress) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        *state.free_calls.entry(address).or_insert(0) += 1;
        state.freed.push(address);
        let resource = state.live.remove(&address);
        let fault = state.faults.remove(&address);
        drop(state);

        // The data struct may be freed here; never under our lock.
        drop(resource);
        match fault {
            None => Ok(()),
            Some(Fault::Error) => Err(NativeError::FreeFailed {
                address,
                reason: "injected fault".to_owned(),
            }),
            Some(Fault::Panic) => panic!("injected panic while freeing {address}"),
        }
    }

    fn mark_owned_references(&self, address: NativeAddress, marker: &Marker<'_>) {
        let (references, cell) = {
            let mut state = self.state.lock();
            state.mark_calls += 1;
            match state.live.get(&address) {
                Some(resource) => (resource.references.clone(), resource.cell.clone()),
                None => return,
            }
        };
        for reference in references {
            marker.mark(reference);
        }
        if let Some(cell) = cell {
            cell.mark();
        }
    }

    fn clear_mark(&self, address: NativeAddress) {
        self.state.lock().cleared.push(address);
    }
}
