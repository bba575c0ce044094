//! NaN-Boxing
//!
//! Encodes a value into 8 bytes using IEEE 754 NaN-boxing. The register VM
//! keeps its register files in this form: one machine word per value, so
//! register moves are plain copies and float arithmetic needs no unboxing.
//!
//! ## Encoding Scheme
//!
//! When the top 13 bits are all set (negative quiet NaN space), the word is
//! a boxed value; otherwise it is a raw IEEE 754 double:
//!
//! ```text
//! Float (normal):  [any double below the boxed threshold]
//! Boxed values:    0xFFF8_0000_0000_0000 | tag << 48 | payload
//!                  tag: bits 48-50 (3 bits)
//!                  payload: bits 0-47 (48 bits)
//! ```
//!
//! ## Type Tags
//!
//! - `INT`: sign-extended 48-bit integer
//! - `OBJ`: heap cell pointer (48-bit canonical address)
//! - `PID`: 48-bit process id
//! - `SPECIAL`: nil / true / false in the low payload bits
//!
//! ## Float Handling
//!
//! Real floats are stored directly. A NaN produced by float arithmetic is
//! canonicalized to a positive quiet NaN that cannot collide with the
//! boxed range.
//!
//! ## Portability
//!
//! `OBJ` assumes 64-bit pointers with the high 16 bits zero (48-bit
//! canonical addresses). On platforms without that property the tagged
//! `Value` enum is the fallback representation.

use crate::value::{ObjRef, Value};

// =============================================================================
// Constants
// =============================================================================

/// Values at or above this threshold are boxed; everything below is a
/// float. The threshold is the negative quiet-NaN space: sign bit,
/// exponent all ones, quiet bit — the top 13 bits set.
const BOX_THRESHOLD: u64 = 0xFFF8_0000_0000_0000;

/// Mask for the 3-bit type tag (bits 48-50)
const TAG_MASK: u64 = 0x0007_0000_0000_0000;

/// Shift amount for the type tag
const TAG_SHIFT: u32 = 48;

/// Mask for the 48-bit payload
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Canonical NaN: positive quiet NaN, safely below the boxed threshold
pub const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Largest boxable integer: 2^47 - 1
pub const MAX_BOX_INT: i64 = (1i64 << 47) - 1;

/// Smallest boxable integer: -2^47
pub const MIN_BOX_INT: i64 = -(1i64 << 47);

/// Type tags for boxed values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxTag {
    Int = 0,
    Obj = 1,
    Pid = 2,
    Special = 3,
}

// SPECIAL payloads
const SPECIAL_NIL: u64 = 0;
const SPECIAL_TRUE: u64 = 1;
const SPECIAL_FALSE: u64 = 2;

// =============================================================================
// NanBox
// =============================================================================

/// An 8-byte NaN-boxed value
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NanBox(u64);

impl NanBox {
    // =========================================================================
    // Type checking
    // =========================================================================

    /// A word below the boxed threshold is a float; this includes +inf,
    /// -inf, and positive NaNs.
    #[inline(always)]
    pub fn is_float(self) -> bool {
        self.0 < BOX_THRESHOLD
    }

    #[inline(always)]
    pub fn is_boxed(self) -> bool {
        self.0 >= BOX_THRESHOLD
    }

    /// Type tag; only meaningful when boxed
    #[inline(always)]
    pub fn tag(self) -> u8 {
        debug_assert!(self.is_boxed(), "tag() on a float");
        ((self.0 & TAG_MASK) >> TAG_SHIFT) as u8
    }

    /// 48-bit payload; only meaningful when boxed
    #[inline(always)]
    pub fn payload(self) -> u64 {
        debug_assert!(self.is_boxed(), "payload() on a float");
        self.0 & PAYLOAD_MASK
    }

    #[inline(always)]
    pub fn is_int(self) -> bool {
        self.is_boxed() && self.tag() == BoxTag::Int as u8
    }

    #[inline(always)]
    pub fn is_obj(self) -> bool {
        self.is_boxed() && self.tag() == BoxTag::Obj as u8
    }

    #[inline(always)]
    pub fn is_pid(self) -> bool {
        self.is_boxed() && self.tag() == BoxTag::Pid as u8
    }

    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self.0 == Self::nil().0
    }

    #[inline(always)]
    pub fn is_bool(self) -> bool {
        self.0 == Self::from_bool(true).0 || self.0 == Self::from_bool(false).0
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    #[inline(always)]
    fn make(tag: BoxTag, payload: u64) -> Self {
        debug_assert!(payload <= PAYLOAD_MASK, "payload exceeds 48 bits");
        NanBox(BOX_THRESHOLD | (u64::from(tag as u8) << TAG_SHIFT) | payload)
    }

    #[inline(always)]
    pub fn nil() -> Self {
        Self::make(BoxTag::Special, SPECIAL_NIL)
    }

    #[inline(always)]
    pub fn from_bool(b: bool) -> Self {
        Self::make(
            BoxTag::Special,
            if b { SPECIAL_TRUE } else { SPECIAL_FALSE },
        )
    }

    /// Box a float; NaNs in the boxed range are canonicalized
    #[inline(always)]
    pub fn from_float(f: f64) -> Self {
        let bits = f.to_bits();
        if bits >= BOX_THRESHOLD {
            NanBox(CANONICAL_NAN)
        } else {
            NanBox(bits)
        }
    }

    /// Box an integer, `None` outside the 48-bit signed range
    #[inline(always)]
    pub fn try_from_int(n: i64) -> Option<Self> {
        if (MIN_BOX_INT..=MAX_BOX_INT).contains(&n) {
            Some(Self::make(BoxTag::Int, (n as u64) & PAYLOAD_MASK))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn from_pid(pid: u64) -> Self {
        debug_assert!(pid <= PAYLOAD_MASK, "pid exceeds 48 bits");
        Self::make(BoxTag::Pid, pid & PAYLOAD_MASK)
    }

    /// Box a heap cell pointer. The reference the caller holds transfers
    /// into the box; unboxing hands it back.
    #[inline(always)]
    pub fn from_obj(r: ObjRef) -> Self {
        let addr = r.as_ptr() as u64;
        debug_assert!(addr <= PAYLOAD_MASK, "pointer exceeds 48-bit address space");
        Self::make(BoxTag::Obj, addr)
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    #[inline(always)]
    pub fn as_float(self) -> f64 {
        debug_assert!(self.is_float(), "as_float() on a boxed value");
        f64::from_bits(self.0)
    }

    /// Sign-extend the 48-bit payload back to i64
    #[inline(always)]
    pub fn as_int(self) -> i64 {
        debug_assert!(self.is_int(), "as_int() on a non-int");
        ((self.payload() << 16) as i64) >> 16
    }

    #[inline(always)]
    pub fn as_pid(self) -> u64 {
        debug_assert!(self.is_pid(), "as_pid() on a non-pid");
        self.payload()
    }

    #[inline(always)]
    pub fn as_obj(self) -> ObjRef {
        debug_assert!(self.is_obj(), "as_obj() on a non-obj");
        ObjRef(self.payload() as *mut crate::value::Obj)
    }

    #[inline(always)]
    pub fn as_bool(self) -> bool {
        debug_assert!(self.is_bool(), "as_bool() on a non-bool");
        self.payload() == SPECIAL_TRUE
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }

    // =========================================================================
    // Value conversion
    // =========================================================================

    /// Encode a `Value`. Integers outside the 48-bit range are `None`; the
    /// register VM promotes those to float at its boundary.
    pub fn try_from_value(v: Value) -> Option<Self> {
        match v {
            Value::Nil => Some(Self::nil()),
            Value::Bool(b) => Some(Self::from_bool(b)),
            Value::Int(n) => Self::try_from_int(n),
            Value::Float(f) => Some(Self::from_float(f)),
            Value::Pid(p) => (p <= PAYLOAD_MASK).then(|| Self::from_pid(p)),
            Value::Obj(r) => Some(Self::from_obj(r)),
        }
    }

    /// Decode back to a `Value`
    pub fn to_value(self) -> Value {
        if self.is_float() {
            return Value::Float(self.as_float());
        }
        match self.tag() {
            t if t == BoxTag::Int as u8 => Value::Int(self.as_int()),
            t if t == BoxTag::Obj as u8 => Value::Obj(self.as_obj()),
            t if t == BoxTag::Pid as u8 => Value::Pid(self.as_pid()),
            _ => match self.payload() {
                SPECIAL_TRUE => Value::Bool(true),
                SPECIAL_FALSE => Value::Bool(false),
                _ => Value::Nil,
            },
        }
    }
}

impl std::fmt::Debug for NanBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_float() {
            write!(f, "NanBox(float {})", self.as_float())
        } else {
            write!(f, "NanBox(tag {} payload {:#x})", self.tag(), self.payload())
        }
    }
}
