//! Native method signatures and the call adapters.
//!
//! [`call`] is the single choke point for managed-to-native calls. It pushes
//! a call frame, takes the GIL, converts the receiver and arguments to
//! addresses, invokes the function pointer, translates a pending native
//! exception, and resolves the returned address. Guards unwind in reverse
//! order on every exit path: GIL first, then the frame.

use std::ffi::{c_int, c_void};
use std::fmt;
use std::mem::transmute;
use std::sync::Arc;

use crate::bridge::Shared;
use crate::context::CallFrame;
use crate::error::BridgeError;
use crate::value::{NativeAddress, Value};

/// `VALUE f(VALUE self)`
pub type Func0 = unsafe extern "C" fn(usize) -> usize;
/// `VALUE f(VALUE self, VALUE a)`
pub type Func1 = unsafe extern "C" fn(usize, usize) -> usize;
/// `VALUE f(VALUE self, VALUE a, VALUE b)`
pub type Func2 = unsafe extern "C" fn(usize, usize, usize) -> usize;
/// `VALUE f(int argc, const VALUE *argv, VALUE self)`
pub type FuncN = unsafe extern "C" fn(c_int, *const usize, usize) -> usize;

/// A native function pointer with its calling convention.
#[derive(Clone, Copy)]
pub enum NativeFunction {
    /// No arguments besides the receiver.
    Arity0(Func0),
    /// One argument.
    Arity1(Func1),
    /// Two arguments.
    Arity2(Func2),
    /// Any number of arguments passed as an array.
    Variadic(FuncN),
}

/// Number of arguments a method accepts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Arity {
    /// Exactly this many.
    Fixed(usize),
    /// Any number.
    Variadic,
}

impl Arity {
    /// Parses the native arity convention: `-1` is variadic.
    #[must_use]
    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            -1 => Some(Self::Variadic),
            0..=2 => usize::try_from(raw).ok().map(Self::Fixed),
            _ => None,
        }
    }

    fn check(self, given: usize) -> Result<(), BridgeError> {
        match self {
            Self::Fixed(expected) if expected != given => {
                Err(BridgeError::ArityMismatch { given, expected })
            }
            _ => Ok(()),
        }
    }
}

impl NativeFunction {
    /// Arity of this function.
    #[must_use]
    pub const fn arity(&self) -> Arity {
        match self {
            Self::Arity0(_) => Arity::Fixed(0),
            Self::Arity1(_) => Arity::Fixed(1),
            Self::Arity2(_) => Arity::Fixed(2),
            Self::Variadic(_) => Arity::Variadic,
        }
    }

    /// Builds a function from an untyped pointer and a native arity.
    ///
    /// # Safety
    ///
    /// `ptr` must be a non-null `extern "C"` function whose signature matches
    /// `arity` as documented on [`Func0`], [`Func1`], [`Func2`] and [`FuncN`].
    pub unsafe fn from_raw(ptr: *const c_void, arity: Arity) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the caller guarantees the signature matches `arity`.
        unsafe {
            Some(match arity {
                Arity::Fixed(0) => Self::Arity0(transmute::<*const c_void, Func0>(ptr)),
                Arity::Fixed(1) => Self::Arity1(transmute::<*const c_void, Func1>(ptr)),
                Arity::Fixed(2) => Self::Arity2(transmute::<*const c_void, Func2>(ptr)),
                Arity::Variadic => Self::Variadic(transmute::<*const c_void, FuncN>(ptr)),
                Arity::Fixed(_) => return None,
            })
        }
    }

    /// Invokes the function with already converted addresses.
    ///
    /// # Safety
    ///
    /// The function must be safe to call with these addresses, and the
    /// caller must hold the GIL.
    unsafe fn invoke(
        self,
        recv: NativeAddress,
        args: &[NativeAddress],
    ) -> Result<NativeAddress, BridgeError> {
        let raw = |i: usize| args[i].as_raw();
        // SAFETY: caller contract; arity was checked against `args.len()`.
        let ret = unsafe {
            match self {
                Self::Arity0(f) => f(recv.as_raw()),
                Self::Arity1(f) => f(recv.as_raw(), raw(0)),
                Self::Arity2(f) => f(recv.as_raw(), raw(0), raw(1)),
                Self::Variadic(f) => {
                    let argc = c_int::try_from(args.len())
                        .map_err(|_| BridgeError::TooManyArguments(args.len()))?;
                    // `NativeAddress` is `repr(transparent)` over `usize`.
                    f(argc, args.as_ptr().cast::<usize>(), recv.as_raw())
                }
            }
        };
        Ok(NativeAddress::from_raw(ret))
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({:?})", self.arity())
    }
}

/// A named native function.
#[derive(Clone, Debug)]
pub struct NativeMethod {
    name: Arc<str>,
    function: NativeFunction,
}

impl NativeMethod {
    /// Creates a method.
    pub fn new(name: impl Into<Arc<str>>, function: NativeFunction) -> Self {
        Self {
            name: name.into(),
            function,
        }
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying function.
    #[must_use]
    pub const fn function(&self) -> NativeFunction {
        self.function
    }

    /// Arity.
    #[must_use]
    pub const fn arity(&self) -> Arity {
        self.function.arity()
    }
}

/// Calls `method` on `recv` with `args`.
///
/// # Safety
///
/// The native function must be sound to call with any handle addresses.
pub(crate) unsafe fn call(
    shared: &Arc<Shared>,
    method: &NativeMethod,
    recv: &Value,
    args: &[Value],
) -> Result<Value, BridgeError> {
    method.arity().check(args.len())?;
    if shared.is_shut_down() {
        return Err(BridgeError::ShutDown);
    }
    let _span = crate::tracing::span_native_call(method.name(), args.len());

    let frame = CallFrame::enter(shared);
    let guard = shared.gil.acquire();

    let recv = shared.address_for(&guard, recv)?;
    // 0, 1 and 2 arguments skip the heap; the conversion is the same.
    let mut inline = [NativeAddress::NIL; 2];
    let spilled: Vec<NativeAddress>;
    let converted: &[NativeAddress] = if args.len() <= inline.len() {
        for (slot, arg) in inline.iter_mut().zip(args) {
            *slot = shared.address_for(&guard, arg)?;
        }
        &inline[..args.len()]
    } else {
        spilled = args
            .iter()
            .map(|arg| shared.address_for(&guard, arg))
            .collect::<Result<_, _>>()?;
        &spilled
    };

    shared.metrics.record_native_call();
    // SAFETY: caller contract; the GIL is held.
    let ret = unsafe { method.function.invoke(recv, converted) }?;

    if let Some(exception) = frame.take_exception() {
        shared.metrics.record_native_exception();
        crate::tracing::log_native_exception(method.name(), &exception);
        return Err(BridgeError::Raised(exception));
    }

    let value = shared.resolve_locked(&guard, ret)?;
    drop(guard);
    drop(frame);
    Ok(value)
}
