//! The C ABI native code calls back into.
//!
//! Extensions receive a pointer to [`UPCALLS`] in their init function. Every
//! entry resolves the bridge through the current call frame, so an upcall made
//! outside a native call only logs and returns `Qnil`.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::bridge::Shared;
use crate::context;
use crate::error::NativeException;
use crate::method::{Arity, NativeFunction};
use crate::object::{DataCell, DataFreeFn, DataMarkFn, DataType, ObjectKind};
use crate::value::{NativeAddress, QNIL};

/// Version of the [`UpcallTable`] layout.
pub const UPCALL_ABI_VERSION: u32 = 1;

/// Function table passed to native extensions.
#[repr(C)]
#[derive(Debug)]
pub struct UpcallTable {
    /// [`UPCALL_ABI_VERSION`].
    pub version: u32,
    /// Reports a reference from native memory during a mark pass. Outside a
    /// pass, keeps the object alive until the current call returns.
    pub gc_mark: unsafe extern "C" fn(usize),
    /// Asks the bridge to clear the mark flag of an address after the next pass.
    pub gc_unmark: unsafe extern "C" fn(usize),
    /// Suppresses cleanup passes. Nests.
    pub gc_disable: unsafe extern "C" fn(),
    /// Re-enables cleanup passes.
    pub gc_enable: unsafe extern "C" fn(),
    /// Allocates a managed object of the given `T_*` kind and returns its address.
    pub new_object: unsafe extern "C" fn(u32) -> usize,
    /// Wraps a native struct: `(type name, dmark, dfree, data) -> address`.
    pub wrap_data: unsafe extern "C" fn(
        *const c_char,
        Option<DataMarkFn>,
        Option<DataFreeFn>,
        *mut c_void,
    ) -> usize,
    /// Raises an exception. Native code must return right after calling it.
    pub raise: unsafe extern "C" fn(*const c_char),
    /// Defines `(owner, name, function, arity)`; returns 0 on success.
    pub define_method: unsafe extern "C" fn(*const c_char, *const c_char, *const c_void, c_int) -> c_int,
}

/// The table handed to every extension.
pub static UPCALLS: UpcallTable = UpcallTable {
    version: UPCALL_ABI_VERSION,
    gc_mark,
    gc_unmark,
    gc_disable,
    gc_enable,
    new_object,
    wrap_data,
    raise,
    define_method,
};

/// Runs `f` against the current bridge, catching panics so none unwind into C.
fn with_bridge<R>(upcall: &str, fallback: R, f: impl FnOnce(&Arc<Shared>) -> R) -> R {
    let Some(shared) = context::current_shared() else {
        crate::tracing::log_upcall_outside_bridge(upcall);
        return fallback;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| f(&shared))) {
        Ok(value) => value,
        Err(_) => {
            crate::tracing::log_invalid_upcall(upcall, "panicked");
            context::raise(NativeException::new(format!("{upcall} panicked")));
            fallback
        }
    }
}

/// # Safety
///
/// `ptr` must be null or a valid NUL-terminated string.
unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller contract.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

unsafe extern "C" fn gc_mark(address: usize) {
    let address = NativeAddress::from_raw(address);
    if crate::mark::with_active(|marker| marker.mark(address)).is_some() {
        return;
    }
    with_bridge("gc_mark", (), |shared| shared.mark(address));
}

unsafe extern "C" fn gc_unmark(address: usize) {
    with_bridge("gc_unmark", (), |shared| {
        shared.unmark_after_pass(NativeAddress::from_raw(address));
    });
}

unsafe extern "C" fn gc_disable() {
    with_bridge("gc_disable", (), |shared| {
        shared.disable_gc();
    });
}

unsafe extern "C" fn gc_enable() {
    with_bridge("gc_enable", (), |shared| {
        if shared.gc.is_disabled() {
            shared.enable_gc();
        } else {
            crate::tracing::log_invalid_upcall("gc_enable", "not disabled");
        }
    });
}

unsafe extern "C" fn new_object(kind: u32) -> usize {
    with_bridge("new_object", QNIL, |shared| {
        let Some(kind) = ObjectKind::from_raw(kind) else {
            crate::tracing::log_invalid_upcall("new_object", "unknown kind");
            context::raise(NativeException::new(format!("unknown object kind {kind:#x}")));
            return QNIL;
        };
        match shared.allocate_managed_object(kind) {
            Ok(address) => address.as_raw(),
            Err(err) => {
                context::raise(NativeException::new(err.to_string()));
                QNIL
            }
        }
    })
}

unsafe extern "C" fn wrap_data(
    name: *const c_char,
    dmark: Option<DataMarkFn>,
    dfree: Option<DataFreeFn>,
    data: *mut c_void,
) -> usize {
    // SAFETY: native callers pass a C string or null.
    let name = unsafe { c_str(name) }.unwrap_or("data").to_owned();
    with_bridge("wrap_data", QNIL, move |shared| {
        let data_type = DataType {
            name,
            mark: dmark,
            free: dfree,
            type_id: None,
        };
        // SAFETY: the extension hands `data` over together with its free
        // routine; nothing else frees it.
        let cell = unsafe { DataCell::from_raw(data_type, data) };
        match shared.wrap_cell(cell) {
            Ok(address) => address.as_raw(),
            Err(err) => {
                context::raise(NativeException::new(err.to_string()));
                QNIL
            }
        }
    })
}

unsafe extern "C" fn raise(message: *const c_char) {
    // SAFETY: native callers pass a C string or null.
    let message = unsafe { c_str(message) }.unwrap_or("native error").to_owned();
    if !context::raise(NativeException::new(message)) {
        crate::tracing::log_upcall_outside_bridge("raise");
    }
}

unsafe extern "C" fn define_method(
    owner: *const c_char,
    name: *const c_char,
    function: *const c_void,
    arity: c_int,
) -> c_int {
    // SAFETY: native callers pass C strings or null.
    let (owner, name) = unsafe { (c_str(owner), c_str(name)) };
    let (Some(owner), Some(name)) = (owner, name) else {
        crate::tracing::log_invalid_upcall("define_method", "bad name");
        return -1;
    };
    let Some(arity) = Arity::from_raw(arity) else {
        crate::tracing::log_invalid_upcall("define_method", "unsupported arity");
        return -1;
    };
    // SAFETY: the extension declares `function` with this arity.
    let Some(function) = (unsafe { NativeFunction::from_raw(function, arity) }) else {
        crate::tracing::log_invalid_upcall("define_method", "null function");
        return -1;
    };
    with_bridge("define_method", -1, |shared| {
        shared.define_method(owner, name, function);
        0
    })
}
