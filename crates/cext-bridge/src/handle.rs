//! Handles and the lookup tables that keep them unique.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cleaner::{CleanerList, SlotKey};
use crate::error::NativeError;
use crate::native::NativeAllocator;
use crate::object::{ManagedObject, ObjectId, ObjectKind, ObjectRef};
use crate::value::NativeAddress;

/// Lifecycle of a [`Handle`].
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandleState {
    /// Linked in the cleaner list; the native resource is live.
    Active = 0,
    /// The managed object was collected; waiting for the reaper.
    Queued = 1,
    /// The native resource has been freed. Terminal.
    Disposed = 2,
}

impl HandleState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Queued,
            _ => Self::Disposed,
        }
    }
}

/// A managed object as native code sees it: a stable address.
///
/// The handle owns the native resource at [`address`](Self::address) and
/// holds only a weak reference to the object. The one exception is the
/// retained set of an owning handle: the objects its native memory was found
/// to reference during the last cleanup pass.
pub struct Handle {
    address: NativeAddress,
    object_id: ObjectId,
    kind: ObjectKind,
    slot: SlotKey,
    object: Weak<ManagedObject>,
    state: AtomicU8,
    retained: Mutex<Vec<ObjectRef>>,
}

impl Handle {
    pub(crate) fn new(address: NativeAddress, object: &ObjectRef, slot: SlotKey) -> Self {
        Self {
            address,
            object_id: object.id(),
            kind: object.kind(),
            slot,
            object: Arc::downgrade(object),
            state: AtomicU8::new(HandleState::Active as u8),
            retained: Mutex::new(Vec::new()),
        }
    }

    /// Native address of the resource.
    #[must_use]
    pub const fn address(&self) -> NativeAddress {
        self.address
    }

    /// Identity of the managed object.
    #[must_use]
    pub const fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Kind of the managed object.
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Position in the cleaner list.
    #[must_use]
    pub const fn slot(&self) -> SlotKey {
        self.slot
    }

    /// Returns `true` if this handle takes part in mark passes.
    #[must_use]
    pub const fn is_owning(&self) -> bool {
        self.kind.is_owning()
    }

    /// Returns the object if it has not been collected.
    #[must_use]
    pub fn object(&self) -> Option<ObjectRef> {
        self.object.upgrade()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Active -> Queued`. Returns `false` if the handle was not active.
    pub(crate) fn mark_queued(&self) -> bool {
        self.state
            .compare_exchange(
                HandleState::Active as u8,
                HandleState::Queued as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Frees the native resource and returns the retained set.
    ///
    /// Callers unlink the handle from the cleaner list first, so this runs at
    /// most once per handle.
    pub(crate) fn dispose(
        &self,
        native: &dyn NativeAllocator,
    ) -> (Result<(), NativeError>, Vec<ObjectRef>) {
        let previous = self.state.swap(HandleState::Disposed as u8, Ordering::AcqRel);
        debug_assert_ne!(
            previous,
            HandleState::Disposed as u8,
            "handle {} disposed twice",
            self.address
        );
        let released = std::mem::take(&mut *self.retained.lock());
        if previous == HandleState::Disposed as u8 {
            return (Ok(()), released);
        }
        (native.free(self.address), released)
    }

    /// Replaces the retained set, returning the previous one.
    pub(crate) fn retain(&self, objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
        std::mem::replace(&mut *self.retained.lock(), objects)
    }

    /// Number of objects currently kept alive by this handle.
    #[must_use]
    pub fn retained_len(&self) -> usize {
        self.retained.lock().len()
    }

    /// Returns `true` if `object` is in the retained set.
    #[must_use]
    pub fn retains(&self, object: &ManagedObject) -> bool {
        self.retained.lock().iter().any(|o| o.id() == object.id())
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("address", &self.address)
            .field("object", &self.object_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle tables. Lives in a [`GilCell`](crate::gil::GilCell).
///
/// `by_object` is keyed by identity and holds no strong reference, so an
/// entry never keeps its object alive; the reaper removes it together with
/// the list entry.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    list: CleanerList<Arc<Handle>>,
    by_object: HashMap<ObjectId, SlotKey>,
    by_address: HashMap<NativeAddress, SlotKey>,
    owners: HashSet<SlotKey>,
}

impl HandleRegistry {
    pub(crate) fn lookup(&self, id: ObjectId) -> Option<Arc<Handle>> {
        let key = self.by_object.get(&id)?;
        self.list.get(*key).cloned()
    }

    pub(crate) fn by_address(&self, address: NativeAddress) -> Option<Arc<Handle>> {
        let key = self.by_address.get(&address)?;
        self.list.get(*key).cloned()
    }

    pub(crate) fn is_address_live(&self, address: NativeAddress) -> bool {
        self.by_address.contains_key(&address)
    }

    /// Links a new handle for `object` at `address`.
    pub(crate) fn insert(&mut self, object: &ObjectRef, address: NativeAddress) -> Arc<Handle> {
        let mut created = None;
        let key = self.list.insert_with(|key| {
            let handle = Arc::new(Handle::new(address, object, key));
            created = Some(Arc::clone(&handle));
            handle
        });
        self.by_object.insert(object.id(), key);
        self.by_address.insert(address, key);
        if object.kind().is_owning() {
            self.owners.insert(key);
        }
        match created {
            Some(handle) => handle,
            None => unreachable!("insert_with always runs its closure"),
        }
    }

    /// Unlinks the handle at `key` from every table.
    pub(crate) fn remove(&mut self, key: SlotKey) -> Option<Arc<Handle>> {
        let handle = self.list.remove(key)?;
        if self.by_object.get(&handle.object_id) == Some(&key) {
            self.by_object.remove(&handle.object_id);
        }
        if self.by_address.get(&handle.address) == Some(&key) {
            self.by_address.remove(&handle.address);
        }
        self.owners.remove(&key);
        Some(handle)
    }

    pub(crate) fn owners(&self) -> Vec<Arc<Handle>> {
        self.owners
            .iter()
            .filter_map(|key| self.list.get(*key).cloned())
            .collect()
    }

    pub(crate) fn handles(&self) -> Vec<Arc<Handle>> {
        self.list.iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    /// Unlinks everything.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Handle>> {
        self.by_object.clear();
        self.by_address.clear();
        self.owners.clear();
        self.list.drain()
    }

    pub(crate) const fn len(&self) -> usize {
        self.list.len()
    }
}
