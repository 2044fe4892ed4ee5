//! The managed-object model the bridge relies on from its host.
//!
//! The host runtime owns objects through [`ObjectRef`] (an `Arc`). The bridge
//! never keeps an object alive on its own: handles hold a [`Weak`] and learn
//! about collection through [`ManagedObject::on_collect`], which fires exactly
//! once when the last strong reference goes away.
//!
//! [`Weak`]: std::sync::Weak

use std::any::TypeId;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mark::{self, Mark};

/// Strong reference to a managed object.
pub type ObjectRef = Arc<ManagedObject>;

type Watcher = Box<dyn FnOnce() + Send>;

/// Identity of a managed object. Never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

impl ObjectId {
    fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Built-in type of a managed object, numbered like the native `T_*` tags.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ObjectKind {
    /// Plain object.
    Object = 0x01,
    /// Class.
    Class = 0x02,
    /// Module.
    Module = 0x03,
    /// Boxed float.
    Float = 0x04,
    /// String.
    String = 0x05,
    /// Array.
    Array = 0x07,
    /// Hash.
    Hash = 0x08,
    /// Integer outside the fixnum range.
    Integer = 0x0a,
    /// Wrapped native struct.
    Data = 0x0c,
}

impl ObjectKind {
    /// Parses a native type tag.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x01 => Self::Object,
            0x02 => Self::Class,
            0x03 => Self::Module,
            0x04 => Self::Float,
            0x05 => Self::String,
            0x07 => Self::Array,
            0x08 => Self::Hash,
            0x0a => Self::Integer,
            0x0c => Self::Data,
            _ => return None,
        })
    }

    /// Returns the native type tag.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Objects of this kind own native memory that may reference other
    /// managed objects, and take part in mark passes.
    #[must_use]
    pub const fn is_owning(self) -> bool {
        matches!(self, Self::Data)
    }
}

/// Native mark routine: reports every managed object the struct references.
pub type DataMarkFn = unsafe extern "C" fn(*mut c_void);
/// Native free routine for a wrapped struct.
pub type DataFreeFn = unsafe extern "C" fn(*mut c_void);

/// Describes a native struct wrapped as a managed object.
#[derive(Clone)]
pub struct DataType {
    /// Diagnostic name.
    pub name: String,
    /// Called during mark passes with the struct pointer.
    pub mark: Option<DataMarkFn>,
    /// Called once when the struct is no longer owned by anyone.
    pub free: Option<DataFreeFn>,
    /// Set for Rust values so [`ManagedObject::downcast_data`] can check the type.
    pub type_id: Option<TypeId>,
}

impl DataType {
    /// Data type for a Rust value stored in a `Box<T>`.
    #[must_use]
    pub fn of<T: Mark + Send + Sync + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>().to_owned(),
            mark: Some(mark_boxed::<T>),
            free: Some(free_boxed::<T>),
            type_id: Some(TypeId::of::<T>()),
        }
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataType")
            .field("name", &self.name)
            .field("mark", &self.mark.is_some())
            .field("free", &self.free.is_some())
            .finish_non_exhaustive()
    }
}

unsafe extern "C" fn mark_boxed<T: Mark>(data: *mut c_void) {
    // SAFETY: `data` came from `Box::<T>::into_raw` in `DataCell::boxed` and
    // stays valid until `free_boxed` runs.
    let value = unsafe { &*data.cast::<T>() };
    mark::with_active(|marker| value.mark(marker));
}

unsafe extern "C" fn free_boxed<T>(data: *mut c_void) {
    // SAFETY: called exactly once by `DataCell::drop` with the pointer
    // produced by `Box::into_raw`.
    drop(unsafe { Box::from_raw(data.cast::<T>()) });
}

/// Owner of a wrapped native struct.
///
/// Shared between the managed object and its native resource; the struct is
/// freed when the last of them drops.
pub struct DataCell {
    data_type: DataType,
    data: *mut c_void,
}

// SAFETY: the struct is only accessed by native code under the GIL, and Rust
// values are required to be `Send + Sync` by `DataCell::boxed`.
unsafe impl Send for DataCell {}
// SAFETY: see above.
unsafe impl Sync for DataCell {}

impl DataCell {
    /// Takes ownership of `data`, to be released with `data_type.free`.
    ///
    /// # Safety
    ///
    /// `data` must be valid for `data_type.mark` and `data_type.free` until
    /// the cell drops, and nothing else may free it.
    pub unsafe fn from_raw(data_type: DataType, data: *mut c_void) -> Self {
        Self { data_type, data }
    }

    /// Boxes a Rust value.
    pub fn boxed<T: Mark + Send + Sync + 'static>(value: T) -> Self {
        let data = Box::into_raw(Box::new(value)).cast::<c_void>();
        // SAFETY: `DataType::of::<T>` matches the box we just leaked.
        unsafe { Self::from_raw(DataType::of::<T>(), data) }
    }

    /// Returns the struct pointer.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut c_void {
        self.data
    }

    /// Returns the data type.
    #[must_use]
    pub const fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Runs the native mark routine, if any.
    ///
    /// Must be called with a marker installed by [`mark::with_marker`].
    pub fn mark(&self) {
        if let Some(mark) = self.data_type.mark {
            // SAFETY: `from_raw` contract.
            unsafe { mark(self.data) };
        }
    }
}

impl Drop for DataCell {
    fn drop(&mut self) {
        if let Some(free) = self.data_type.free {
            // SAFETY: `from_raw` contract; this is the only free.
            unsafe { free(self.data) };
        }
    }
}

impl fmt::Debug for DataCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCell")
            .field("type", &self.data_type.name)
            .field("data", &self.data)
            .finish()
    }
}

enum Payload {
    Empty,
    Integer(i64),
    Data(Arc<DataCell>),
}

/// A managed object as seen by the bridge.
pub struct ManagedObject {
    id: ObjectId,
    kind: ObjectKind,
    payload: Payload,
    watchers: Mutex<Vec<Watcher>>,
}

impl ManagedObject {
    fn with_payload(kind: ObjectKind, payload: Payload) -> ObjectRef {
        Arc::new(Self {
            id: ObjectId::next(),
            kind,
            payload,
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Allocates an object with no payload.
    #[must_use]
    pub fn new(kind: ObjectKind) -> ObjectRef {
        Self::with_payload(kind, Payload::Empty)
    }

    /// Boxes an integer that does not fit in a fixnum.
    #[must_use]
    pub fn boxed_integer(value: i64) -> ObjectRef {
        Self::with_payload(ObjectKind::Integer, Payload::Integer(value))
    }

    /// Wraps a native struct.
    #[must_use]
    pub fn wrap_data(cell: DataCell) -> ObjectRef {
        Self::with_payload(ObjectKind::Data, Payload::Data(Arc::new(cell)))
    }

    /// Returns the object's identity.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Returns the object's kind.
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Returns the boxed integer value.
    #[must_use]
    pub const fn integer_value(&self) -> Option<i64> {
        match self.payload {
            Payload::Integer(i) => Some(i),
            _ => None,
        }
    }

    /// Returns the wrapped native struct.
    #[must_use]
    pub const fn data_cell(&self) -> Option<&Arc<DataCell>> {
        match &self.payload {
            Payload::Data(cell) => Some(cell),
            _ => None,
        }
    }

    /// Returns the wrapped Rust value if it is a `T`.
    #[must_use]
    pub fn downcast_data<T: 'static>(&self) -> Option<&T> {
        let cell = self.data_cell()?;
        if cell.data_type.type_id != Some(TypeId::of::<T>()) {
            return None;
        }
        // SAFETY: the type id matches the box created by `DataCell::boxed`,
        // and the cell outlives `&self`.
        Some(unsafe { &*cell.data.cast::<T>() })
    }

    /// Registers `f` to run when the last strong reference drops.
    ///
    /// Each callback runs exactly once, on whichever thread drops the object.
    /// It must not block or take the GIL.
    pub fn on_collect(&self, f: impl FnOnce() + Send + 'static) {
        self.watchers.lock().push(Box::new(f));
    }
}

impl Drop for ManagedObject {
    fn drop(&mut self) {
        for watcher in std::mem::take(self.watchers.get_mut()) {
            watcher();
        }
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_object_ids_are_unique() {
        let a = ManagedObject::new(ObjectKind::Object);
        let b = ManagedObject::new(ObjectKind::Object);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_on_collect_runs_once_on_last_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let object = ManagedObject::new(ObjectKind::String);
        let counter = Arc::clone(&fired);
        object.on_collect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = Arc::clone(&object);
        drop(object);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [ObjectKind::Object, ObjectKind::Data, ObjectKind::Integer] {
            assert_eq!(ObjectKind::from_raw(kind.as_raw()), Some(kind));
        }
        assert_eq!(ObjectKind::from_raw(0x1f), None);
        assert!(ObjectKind::Data.is_owning());
        assert!(!ObjectKind::Array.is_owning());
    }

    struct Payload2 {
        value: u32,
    }

    impl Mark for Payload2 {
        fn mark(&self, _marker: &mark::Marker<'_>) {}
    }

    #[test]
    fn test_downcast_data_checks_type() {
        let object = ManagedObject::wrap_data(DataCell::boxed(Payload2 { value: 7 }));
        assert_eq!(object.downcast_data::<Payload2>().map(|p| p.value), Some(7));
        assert!(object.downcast_data::<u32>().is_none());
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Mark for DropCounter {
        fn mark(&self, _marker: &mark::Marker<'_>) {}
    }

    #[test]
    fn test_data_freed_with_last_owner() {
        let drops = Arc::new(AtomicUsize::new(0));
        let object = ManagedObject::wrap_data(DataCell::boxed(DropCounter(Arc::clone(&drops))));
        let cell = Arc::clone(object.data_cell().unwrap());
        drop(object);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(cell);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
