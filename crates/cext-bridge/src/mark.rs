//! Mark trait and the active-marker scope used by mark passes.
//!
//! During a cleanup pass the bridge asks every owning handle's native
//! resource which managed objects its memory references. Native code answers
//! through the `gc_mark` upcall; Rust data wrapped with
//! [`Bridge::wrap_data`](crate::Bridge::wrap_data) answers through [`Mark`].
//! Both end up at the [`Marker`] installed for the current pass.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::Arc;

use crate::object::ManagedObject;
use crate::value::{NativeAddress, Value};

// ============================================================================
// Core Traits
// ============================================================================

/// A type that can report the managed objects it references from native memory.
///
/// Implementations should call [`Marker::mark`] for every [`NativeAddress`]
/// the value stores. A missed address is not unsafe, but the object behind
/// it may be collected while the value still points at it.
///
/// Prefer `#[derive(Mark)]` over manual implementations.
///
/// ```ignore
/// struct Node {
///     label: String,
///     next: Option<NativeAddress>,
/// }
///
/// impl Mark for Node {
///     fn mark(&self, marker: &Marker<'_>) {
///         self.next.mark(marker);
///     }
/// }
/// ```
pub trait Mark {
    /// Report every reference held by `self`.
    fn mark(&self, marker: &Marker<'_>);
}

/// Receiver of mark reports for one pass.
pub trait MarkSink {
    /// Records that native memory references `address`.
    ///
    /// Returns `true` if the address was newly marked by the current owner.
    fn mark_address(&self, address: NativeAddress) -> bool;

    /// Records a reference held as a managed object instead of an address.
    fn mark_object(&self, object: &ManagedObject) -> bool {
        let _ = object;
        false
    }
}

/// Handle passed to [`Mark::mark`].
#[derive(Clone, Copy)]
pub struct Marker<'a> {
    sink: &'a dyn MarkSink,
}

impl<'a> Marker<'a> {
    /// Wraps a sink.
    #[must_use]
    pub const fn new(sink: &'a dyn MarkSink) -> Self {
        Self { sink }
    }

    /// Reports a native address. Immediates are ignored.
    pub fn mark(&self, address: NativeAddress) -> bool {
        !address.is_immediate() && self.sink.mark_address(address)
    }

    /// Reports a managed object.
    pub fn mark_object(&self, object: &ManagedObject) -> bool {
        self.sink.mark_object(object)
    }
}

// ============================================================================
// Active marker scope
// ============================================================================

thread_local! {
    static ACTIVE: Cell<Option<*const ()>> = const { Cell::new(None) };
}

struct Restore(Option<*const ()>);

impl Drop for Restore {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.0));
    }
}

/// Makes `marker` available to [`with_active`] on this thread while `f` runs.
///
/// Native mark routines cannot receive a Rust reference, so they reach the
/// current pass through this scope. Scopes nest; the previous marker is
/// restored even if `f` panics.
pub fn with_marker<R>(marker: &Marker<'_>, f: impl FnOnce() -> R) -> R {
    let ptr = std::ptr::from_ref(marker).cast::<()>();
    let _restore = Restore(ACTIVE.with(|active| active.replace(Some(ptr))));
    f()
}

/// Calls `f` with the marker installed by the innermost [`with_marker`].
///
/// Returns `None` outside a mark pass.
pub fn with_active<R>(f: impl FnOnce(&Marker<'_>) -> R) -> Option<R> {
    let ptr = ACTIVE.with(Cell::get)?;
    // SAFETY: `with_marker` keeps the marker borrowed for as long as the
    // pointer is installed, and `Restore` removes it before the borrow ends.
    let marker = unsafe { &*ptr.cast::<Marker<'_>>() };
    Some(f(marker))
}

/// Returns `true` if a mark pass is running on this thread.
#[must_use]
pub fn is_marking() -> bool {
    ACTIVE.with(Cell::get).is_some()
}

// ============================================================================
// Mark implementations for bridge types
// ============================================================================

impl Mark for NativeAddress {
    #[inline]
    fn mark(&self, marker: &Marker<'_>) {
        marker.mark(*self);
    }
}

impl Mark for ManagedObject {
    #[inline]
    fn mark(&self, marker: &Marker<'_>) {
        marker.mark_object(self);
    }
}

impl Mark for Value {
    fn mark(&self, marker: &Marker<'_>) {
        if let Self::Object(object) = self {
            marker.mark_object(object);
        }
    }
}

// ============================================================================
// Mark implementations for primitive types
// ============================================================================

macro_rules! impl_mark_for_leaves {
    ($($t:ty),* $(,)?) => {
        $(
            impl Mark for $t {
                #[inline]
                fn mark(&self, _marker: &Marker<'_>) {}
            }
        )*
    };
}

impl_mark_for_leaves! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool, char, (),
    String, str,
    std::ffi::CString,
    std::time::Duration,
    std::sync::atomic::AtomicBool,
    std::sync::atomic::AtomicUsize,
    std::sync::atomic::AtomicU64,
}

// ============================================================================
// Mark implementations for containers
// ============================================================================

impl<T: Mark + ?Sized> Mark for &T {
    #[inline]
    fn mark(&self, marker: &Marker<'_>) {
        T::mark(self, marker);
    }
}

impl<T: Mark + ?Sized> Mark for Box<T> {
    #[inline]
    fn mark(&self, marker: &Marker<'_>) {
        T::mark(self, marker);
    }
}

impl<T: Mark + ?Sized> Mark for Arc<T> {
    #[inline]
    fn mark(&self, marker: &Marker<'_>) {
        T::mark(self, marker);
    }
}

impl<T: Mark> Mark for Option<T> {
    #[inline]
    fn mark(&self, marker: &Marker<'_>) {
        if let Some(value) = self {
            value.mark(marker);
        }
    }
}

impl<T: Mark> Mark for [T] {
    fn mark(&self, marker: &Marker<'_>) {
        for item in self {
            item.mark(marker);
        }
    }
}

impl<T: Mark, const N: usize> Mark for [T; N] {
    fn mark(&self, marker: &Marker<'_>) {
        self.as_slice().mark(marker);
    }
}

impl<T: Mark> Mark for Vec<T> {
    fn mark(&self, marker: &Marker<'_>) {
        self.as_slice().mark(marker);
    }
}

impl<T: Mark> Mark for VecDeque<T> {
    fn mark(&self, marker: &Marker<'_>) {
        for item in self {
            item.mark(marker);
        }
    }
}

impl<K, V: Mark, S: BuildHasher> Mark for HashMap<K, V, S> {
    fn mark(&self, marker: &Marker<'_>) {
        for value in self.values() {
            value.mark(marker);
        }
    }
}

impl<K, V: Mark> Mark for BTreeMap<K, V> {
    fn mark(&self, marker: &Marker<'_>) {
        for value in self.values() {
            value.mark(marker);
        }
    }
}

impl<T: Mark + Copy> Mark for Cell<T> {
    fn mark(&self, marker: &Marker<'_>) {
        self.get().mark(marker);
    }
}

impl<T: Mark + ?Sized> Mark for RefCell<T> {
    fn mark(&self, marker: &Marker<'_>) {
        // A value borrowed mutably during a pass is being rewritten; skip it
        // and let the carried roots cover it until the next pass.
        if let Ok(value) = self.try_borrow() {
            value.mark(marker);
        }
    }
}

/// The lock must not be held across a GIL release, or the pass blocks on it.
impl<T: Mark + ?Sized> Mark for parking_lot::Mutex<T> {
    fn mark(&self, marker: &Marker<'_>) {
        self.lock().mark(marker);
    }
}

impl<T: Mark + ?Sized> Mark for parking_lot::RwLock<T> {
    fn mark(&self, marker: &Marker<'_>) {
        self.read().mark(marker);
    }
}

macro_rules! impl_mark_for_tuples {
    () => {};
    ($first:ident $(, $rest:ident)*) => {
        impl<$first: Mark $(, $rest: Mark)*> Mark for ($first, $($rest,)*) {
            #[allow(non_snake_case)]
            fn mark(&self, marker: &Marker<'_>) {
                let ($first, $($rest,)*) = self;
                $first.mark(marker);
                $($rest.mark(marker);)*
            }
        }
        impl_mark_for_tuples!($($rest),*);
    };
}

impl_mark_for_tuples!(A, B, C, D, E, F);
