//! Native addresses and the tagged-immediate encoding.
//!
//! Every value crossing the bridge is a pointer-sized integer on the native
//! side. Small immutable values (`nil`, booleans, fixnums, symbols) carry
//! their payload directly in that integer; everything else is the address of
//! a native resource owned by a [`Handle`](crate::Handle).
//!
//! The bit layout matches the classic non-flonum C extension ABI:
//!
//! | Pattern              | Meaning                         |
//! |----------------------|---------------------------------|
//! | `0x00`               | `false`                         |
//! | `0x02`               | `true`                          |
//! | `0x04`               | `nil`                           |
//! | `xxxx_xxx1`          | fixnum, value stored `<< 1`     |
//! | `(id << 8) \| 0x0e`  | interned symbol                 |
//! | 8-byte aligned, != 0 | native resource address          |

use std::fmt;
use std::sync::Arc;

use crate::object::{ManagedObject, ObjectKind, ObjectRef};

/// Native encoding of `false`.
pub const QFALSE: usize = 0x00;
/// Native encoding of `true`.
pub const QTRUE: usize = 0x02;
/// Native encoding of `nil`.
pub const QNIL: usize = 0x04;
/// Native encoding of the "no value" sentinel. Never produced by [`Immediate`].
pub const QUNDEF: usize = 0x06;

/// Low bit set on every fixnum.
pub const FIXNUM_FLAG: usize = 0x01;
/// Low byte of every symbol.
pub const SYMBOL_FLAG: usize = 0x0e;
/// Shift applied to symbol ids.
pub const SPECIAL_SHIFT: u32 = 8;

/// Alignment every native resource address must satisfy.
pub const RESOURCE_ALIGN: usize = 8;

/// Largest integer representable as a fixnum.
pub const FIXNUM_MAX: i64 = (isize::MAX >> 1) as i64;
/// Smallest integer representable as a fixnum.
pub const FIXNUM_MIN: i64 = (isize::MIN >> 1) as i64;
/// Largest symbol id representable as an immediate.
pub const SYMBOL_MAX: usize = usize::MAX >> SPECIAL_SHIFT;

/// A pointer-sized integer as seen by native code.
///
/// This is either a tagged immediate or the address of a native resource.
/// The bridge never dereferences it; only the
/// [`NativeAllocator`](crate::native::NativeAllocator) that produced it may.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeAddress(usize);

impl NativeAddress {
    /// `false` as a native address.
    pub const FALSE: Self = Self(QFALSE);
    /// `true` as a native address.
    pub const TRUE: Self = Self(QTRUE);
    /// `nil` as a native address.
    pub const NIL: Self = Self(QNIL);

    /// Wraps a raw native integer.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw native integer.
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Returns `true` if this address encodes a value instead of pointing at
    /// a native resource.
    ///
    /// Resources are non-null and [`RESOURCE_ALIGN`]-aligned, so every other
    /// bit pattern belongs to the immediate space.
    #[inline]
    #[must_use]
    pub const fn is_immediate(self) -> bool {
        self.0 == QFALSE || self.0 & (RESOURCE_ALIGN - 1) != 0
    }

    /// Returns `true` if this address can name a native resource.
    #[inline]
    #[must_use]
    pub const fn is_resource(self) -> bool {
        !self.is_immediate()
    }
}

impl fmt::Debug for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeAddress({:#x})", self.0)
    }
}

impl fmt::Display for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Interned identifier assigned by the host's symbol table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SymbolId(usize);

impl SymbolId {
    /// Returns `None` if `id` does not fit in the immediate payload.
    #[must_use]
    pub const fn new(id: usize) -> Option<Self> {
        if id <= SYMBOL_MAX {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Returns the host's id.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// A value that travels by value: no handle, no native allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Immediate {
    /// `nil`.
    Nil,
    /// `true` / `false`.
    Bool(bool),
    /// An integer within [`FIXNUM_MIN`]`..=`[`FIXNUM_MAX`].
    Fixnum(i64),
    /// An interned symbol.
    Symbol(SymbolId),
}

impl Immediate {
    /// Returns the fixnum for `value`, or `None` if it is out of range.
    #[must_use]
    pub const fn fixnum(value: i64) -> Option<Self> {
        if value >= FIXNUM_MIN && value <= FIXNUM_MAX {
            Some(Self::Fixnum(value))
        } else {
            None
        }
    }

    /// Serializes to the flat integer native code sees.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub const fn encode(self) -> NativeAddress {
        let raw = match self {
            Self::Nil => QNIL,
            Self::Bool(true) => QTRUE,
            Self::Bool(false) => QFALSE,
            // Range is checked at construction; the shift cannot overflow.
            Self::Fixnum(value) => ((value as isize as usize) << 1) | FIXNUM_FLAG,
            Self::Symbol(id) => (id.0 << SPECIAL_SHIFT) | SYMBOL_FLAG,
        };
        NativeAddress(raw)
    }

    /// Parses an immediate bit pattern.
    ///
    /// Returns `None` for resource addresses and for reserved patterns such
    /// as [`QUNDEF`].
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn decode(address: NativeAddress) -> Option<Self> {
        let raw = address.0;
        if raw & FIXNUM_FLAG != 0 {
            return Some(Self::Fixnum(((raw as isize) >> 1) as i64));
        }
        match raw {
            QFALSE => Some(Self::Bool(false)),
            QTRUE => Some(Self::Bool(true)),
            QNIL => Some(Self::Nil),
            _ if raw & 0xff == SYMBOL_FLAG => Some(Self::Symbol(SymbolId(raw >> SPECIAL_SHIFT))),
            _ => None,
        }
    }
}

impl From<Immediate> for Value {
    fn from(immediate: Immediate) -> Self {
        match immediate {
            Immediate::Nil => Self::Nil,
            Immediate::Bool(b) => Self::Bool(b),
            Immediate::Fixnum(i) => Self::Integer(i),
            Immediate::Symbol(id) => Self::Symbol(id),
        }
    }
}

/// A managed value as the host runtime hands it to the bridge.
#[derive(Clone)]
pub enum Value {
    /// `nil`.
    Nil,
    /// A boolean.
    Bool(bool),
    /// An integer of any size; out-of-range values are boxed on conversion.
    Integer(i64),
    /// An interned symbol.
    Symbol(SymbolId),
    /// A heap object with identity.
    Object(ObjectRef),
}

impl Value {
    /// Returns the immediate encoding, or `None` if the value needs a handle.
    #[must_use]
    pub const fn as_immediate(&self) -> Option<Immediate> {
        match self {
            Self::Nil => Some(Immediate::Nil),
            Self::Bool(b) => Some(Immediate::Bool(*b)),
            Self::Integer(i) => Immediate::fixnum(*i),
            Self::Symbol(id) => Some(Immediate::Symbol(*id)),
            Self::Object(_) => None,
        }
    }

    /// Wraps a managed object, unboxing boxed integers.
    #[must_use]
    pub fn from_object(object: ObjectRef) -> Self {
        match object.integer_value() {
            Some(i) if object.kind() == ObjectKind::Integer => Self::Integer(i),
            _ => Self::Object(object),
        }
    }

    /// Returns the object for values that need a handle.
    ///
    /// Out-of-range integers are boxed into a fresh [`ObjectKind::Integer`]
    /// object; every call boxes anew, as a host allocating a bignum would.
    #[must_use]
    pub fn to_object(&self) -> Option<ObjectRef> {
        match self {
            Self::Object(object) => Some(Arc::clone(object)),
            Self::Integer(i) if Immediate::fixnum(*i).is_none() => {
                Some(ManagedObject::boxed_integer(*i))
            }
            _ => None,
        }
    }

    /// Returns the object if this is [`Value::Object`].
    #[must_use]
    pub const fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    /// Objects compare by identity, everything else by value.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Symbol(id) => write!(f, ":#{}", id.get()),
            Self::Object(object) => write!(f, "#<{:?} {:?}>", object.kind(), object.id()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Self::from_object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_immediates() {
        for raw in [QFALSE, QTRUE, QNIL, QUNDEF] {
            assert!(NativeAddress::from_raw(raw).is_immediate());
        }
        assert!(NativeAddress::from_raw(0x1000).is_resource());
        assert!(NativeAddress::from_raw(0x1004).is_immediate());
    }

    #[test]
    fn test_fixnum_edges() {
        for value in [0, 1, -1, 42, -42, FIXNUM_MAX, FIXNUM_MIN] {
            let imm = Immediate::fixnum(value).unwrap();
            let addr = imm.encode();
            assert!(addr.is_immediate());
            assert_eq!(addr.as_raw() & FIXNUM_FLAG, FIXNUM_FLAG);
            assert_eq!(Immediate::decode(addr), Some(Immediate::Fixnum(value)));
        }
    }

    #[test]
    fn test_fixnum_out_of_range() {
        assert!(Immediate::fixnum(FIXNUM_MAX + 1).is_none());
        assert!(Immediate::fixnum(FIXNUM_MIN - 1).is_none());
        assert!(Value::Integer(i64::MAX).as_immediate().is_none());
    }

    #[test]
    fn test_special_constants() {
        assert_eq!(Immediate::Nil.encode(), NativeAddress::NIL);
        assert_eq!(Immediate::Bool(true).encode(), NativeAddress::TRUE);
        assert_eq!(Immediate::Bool(false).encode(), NativeAddress::FALSE);
        assert_eq!(Immediate::decode(NativeAddress::NIL), Some(Immediate::Nil));
        assert_eq!(Immediate::decode(NativeAddress::from_raw(QUNDEF)), None);
    }

    #[test]
    fn test_symbol_encoding() {
        let id = SymbolId::new(1234).unwrap();
        let addr = Immediate::Symbol(id).encode();
        assert_eq!(addr.as_raw() & 0xff, SYMBOL_FLAG);
        assert!(addr.is_immediate());
        assert_eq!(Immediate::decode(addr), Some(Immediate::Symbol(id)));
        assert!(SymbolId::new(SYMBOL_MAX).is_some());
        assert!(SymbolId::new(SYMBOL_MAX + 1).is_none());
    }

    #[test]
    fn test_resource_address_does_not_decode() {
        assert_eq!(Immediate::decode(NativeAddress::from_raw(0x7f00_0000_1000)), None);
    }

    #[test]
    fn test_value_identity_equality() {
        let a = ManagedObject::new(ObjectKind::Object);
        let b = ManagedObject::new(ObjectKind::Object);
        assert_eq!(Value::Object(a.clone()), Value::Object(a));
        assert_ne!(Value::Object(b), Value::Nil);
        assert_eq!(Value::Integer(3), Value::from(3));
    }

    #[test]
    fn test_boxed_integer_round_trip() {
        let value = Value::Integer(i64::MIN);
        let boxed = value.to_object().unwrap();
        assert_eq!(boxed.kind(), ObjectKind::Integer);
        assert_eq!(Value::from_object(boxed), value);
    }
}
