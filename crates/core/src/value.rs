//! Value - What the language talks about
//!
//! A `Value` is either an immediate (nil, bool, int, float, pid) carried
//! inline, or a reference to a heap cell (`Obj`) holding one of the
//! container/composite payloads. Heap cells carry an atomic refcount with
//! two sentinels, copy-on-write flags, and the GC's mark/generation bits.
//!
//! ## Reference ownership
//!
//! Every stored reference owns a refcount: operand-stack slots, frame
//! locals, register-file slots, container elements, mailbox entries, timer
//! contexts, and manual `retain`s. Dropping a stored reference goes through
//! `release`, which destroys the payload when the last reference dies.
//!
//! ## Refcount protocol
//!
//! - `retain` is a CAS loop. `SATURATED` cells are permanently live and the
//!   retain is a no-op. A cell observed at `FREEING` or 0 is already dead
//!   and cannot be resurrected; the retain fails.
//! - `release` is a CAS loop. The last reference transitions `1 → FREEING`
//!   directly, which excludes a concurrent retainer from resurrecting the
//!   cell, and is the sole authorization to destroy the payload.
//!
//! ## Thread safety
//!
//! Payload mutation only happens on an exclusively owned cell (refcount 1
//! and not `COW_SHARED`); shared cells are cloned before mutation. Reads of
//! a shared payload are therefore never concurrent with a write, and the
//! header fields that do cross threads (refcount, flags, gc state) are
//! atomics.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::hash::fnv1a;
use crate::map::RawMap;
use crate::strings::BlocString;

// =============================================================================
// Refcount sentinels
// =============================================================================

/// Permanently live (interned); never freed by refcounting
pub const RC_SATURATED: u32 = u32::MAX;

/// Claimed for destruction; blocks concurrent resurrection
pub const RC_FREEING: u32 = u32::MAX - 1;

/// Largest ordinary refcount before saturation
const RC_MAX_ORDINARY: u32 = u32::MAX - 2;

bitflags! {
    /// Per-cell flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValueFlags: u8 {
        /// Payload never mutates after construction (design property)
        const IMMUTABLE = 0b0000_0001;
        /// Shared across owners; mutation must clone first
        const COW_SHARED = 0b0000_0010;
    }
}

// GC state byte: two mark bits, a generation bit, a remembered bit.
pub const GC_MARK_MASK: u8 = 0b0000_0011;
pub const GC_WHITE: u8 = 0;
pub const GC_GRAY: u8 = 1;
pub const GC_BLACK: u8 = 2;
pub const GC_OLD: u8 = 0b0000_0100;
pub const GC_REMEMBERED: u8 = 0b0000_1000;

/// Owner id meaning "not tracked by any heap" (interned / pool constants)
pub const HEAP_NONE: u32 = 0;

// =============================================================================
// Heap cell
// =============================================================================

/// Header shared by every heap cell
pub struct ObjHeader {
    pub(crate) refcount: AtomicU32,
    flags: AtomicU8,
    gc: AtomicU8,
    survivals: AtomicU8,
    /// Id of the owning heap; `HEAP_NONE` for heapless cells
    pub(crate) owner: u32,
    /// Bytes charged against the owning heap for this cell
    pub(crate) bytes: AtomicU32,
    /// Intrusive link in the owning heap's allocation list
    pub(crate) next: AtomicPtr<Obj>,
}

/// A heap cell: header + payload
pub struct Obj {
    pub(crate) header: ObjHeader,
    payload: UnsafeCell<ObjPayload>,
}

// Safety: Obj crosses threads inside messages. The header fields that are
// touched concurrently (refcount, flags, gc) are atomics. The payload is
// only mutated while exclusively owned (refcount 1, not COW_SHARED), so a
// shared reader never races a writer. The allocation-list link is only
// mutated by the owning heap's worker.
unsafe impl Send for Obj {}
unsafe impl Sync for Obj {}

/// Function payload: an index into the bytecode function table
#[derive(Debug, Clone)]
pub struct FunctionData {
    pub fn_index: u32,
    pub arity: u8,
    pub name: Option<String>,
}

/// Closure payload: a function plus captured upvalues
#[derive(Debug)]
pub struct ClosureData {
    pub fn_index: u32,
    pub arity: u8,
    pub upvalues: Vec<Value>,
}

/// Nominal record payload
#[derive(Debug)]
pub struct StructData {
    pub type_name: String,
    pub fields: Vec<(String, Value)>,
}

/// Tagged-union payload
#[derive(Debug)]
pub struct EnumData {
    pub type_name: String,
    pub variant: String,
    pub payload: Option<Value>,
}

/// `ok(v)` / `err(e)` payload
#[derive(Debug)]
pub struct ResultData {
    pub is_ok: bool,
    pub inner: Value,
}

/// The heap-backed payload variants
pub enum ObjPayload {
    Str(BlocString),
    Bytes(Vec<u8>),
    Vector(Box<[f64]>),
    Array(Vec<Value>),
    Map(RawMap),
    Function(FunctionData),
    Closure(ClosureData),
    Struct(StructData),
    Enum(EnumData),
    Opt(Option<Value>),
    Res(ResultData),
    /// Tombstone left after destruction; reclaimed by the owning heap's sweep
    Freed,
}

impl ObjPayload {
    /// Whether this payload kind never mutates after construction
    pub fn is_immutable_kind(&self) -> bool {
        matches!(
            self,
            ObjPayload::Str(_) | ObjPayload::Vector(_) | ObjPayload::Function(_)
        )
    }

    /// Visit every child value reference held by this payload
    pub fn for_each_child(&self, mut f: impl FnMut(Value)) {
        match self {
            ObjPayload::Array(items) => {
                for &v in items {
                    f(v);
                }
            }
            ObjPayload::Map(map) => map.for_each_value(&mut f),
            ObjPayload::Closure(c) => {
                for &v in &c.upvalues {
                    f(v);
                }
            }
            ObjPayload::Struct(s) => {
                for &(_, v) in &s.fields {
                    f(v);
                }
            }
            ObjPayload::Enum(e) => {
                if let Some(v) = e.payload {
                    f(v);
                }
            }
            ObjPayload::Opt(Some(v)) => f(*v),
            ObjPayload::Res(r) => f(r.inner),
            _ => {}
        }
    }

    /// Rough heap footprint in bytes, for allocation accounting
    pub fn footprint(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            ObjPayload::Str(s) => s.len(),
            ObjPayload::Bytes(b) => b.capacity(),
            ObjPayload::Vector(v) => v.len() * 8,
            ObjPayload::Array(a) => a.capacity() * std::mem::size_of::<Value>(),
            ObjPayload::Map(m) => m.footprint(),
            ObjPayload::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<Value>(),
            ObjPayload::Struct(s) => s.fields.len() * (std::mem::size_of::<Value>() + 16),
            _ => 0,
        }
    }
}

impl Obj {
    /// Build a fresh cell. Refcount starts at 1 (the creator's reference);
    /// new cells are white and young.
    pub(crate) fn new(payload: ObjPayload, owner: u32) -> Box<Obj> {
        let mut flags = ValueFlags::empty();
        if payload.is_immutable_kind() {
            flags |= ValueFlags::IMMUTABLE;
        }
        Box::new(Obj {
            header: ObjHeader {
                refcount: AtomicU32::new(1),
                flags: AtomicU8::new(flags.bits()),
                gc: AtomicU8::new(GC_WHITE),
                survivals: AtomicU8::new(0),
                owner,
                bytes: AtomicU32::new(0),
                next: AtomicPtr::new(std::ptr::null_mut()),
            },
            payload: UnsafeCell::new(payload),
        })
    }

    /// Build a permanently live interned cell (refcount `SATURATED`).
    pub fn intern(payload: ObjPayload) -> ObjRef {
        let boxed = Obj::new(payload, HEAP_NONE);
        boxed.header.refcount.store(RC_SATURATED, Ordering::Release);
        ObjRef(Box::into_raw(boxed))
    }

    /// Build a heapless cell with an ordinary refcount of 1, owned by the
    /// caller. Constant pools use these: the chunk owns one reference and
    /// the normal retain/release protocol governs sharing.
    pub fn standalone(payload: ObjPayload) -> Value {
        Value::Obj(ObjRef(Box::into_raw(Obj::new(payload, HEAP_NONE))))
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.header.refcount.load(Ordering::Acquire)
    }

    #[inline]
    pub fn flags(&self) -> ValueFlags {
        ValueFlags::from_bits_truncate(self.header.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: ValueFlags) {
        self.header.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: ValueFlags) {
        self.header.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    // GC state accessors. The collector only runs on the owning worker, so
    // relaxed ordering is sufficient for these bits.

    #[inline]
    pub fn mark(&self) -> u8 {
        self.header.gc.load(Ordering::Relaxed) & GC_MARK_MASK
    }

    pub fn set_mark(&self, mark: u8) {
        let old = self.header.gc.load(Ordering::Relaxed);
        self.header
            .gc
            .store((old & !GC_MARK_MASK) | mark, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_old(&self) -> bool {
        self.header.gc.load(Ordering::Relaxed) & GC_OLD != 0
    }

    pub fn promote_old(&self) {
        self.header.gc.fetch_or(GC_OLD, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_remembered(&self) -> bool {
        self.header.gc.load(Ordering::Relaxed) & GC_REMEMBERED != 0
    }

    pub fn set_remembered(&self, on: bool) {
        if on {
            self.header.gc.fetch_or(GC_REMEMBERED, Ordering::Relaxed);
        } else {
            self.header.gc.fetch_and(!GC_REMEMBERED, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn survivals(&self) -> u8 {
        self.header.survivals.load(Ordering::Relaxed)
    }

    pub fn bump_survivals(&self) -> u8 {
        self.header.survivals.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Shared view of the payload.
    ///
    /// # Safety
    /// The caller must hold a live reference to this cell (refcount owned),
    /// so the payload cannot be concurrently destroyed or mutated in place.
    #[inline]
    pub unsafe fn payload(&self) -> &ObjPayload {
        unsafe { &*self.payload.get() }
    }

    /// Exclusive view of the payload.
    ///
    /// # Safety
    /// The caller must have established exclusive ownership: refcount 1 and
    /// not `COW_SHARED`, on the owning worker thread.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self) -> &mut ObjPayload {
        unsafe { &mut *self.payload.get() }
    }
}

/// Reference to a heap cell. Plain copyable pointer; ownership is tracked
/// by the refcount protocol, not by the type system.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(pub(crate) *mut Obj);

impl ObjRef {
    #[inline]
    pub fn as_obj(&self) -> &Obj {
        // Safety: ObjRefs are only minted for live cells; the holder owns a
        // reference, so the cell cannot have been deallocated.
        unsafe { &*self.0 }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut Obj {
        self.0
    }

    /// Allocation identity, used for identity hashing and shape ids
    #[inline]
    pub fn identity(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({:p})", self.0)
    }
}

// =============================================================================
// Value
// =============================================================================

/// A dynamically typed datum: immediates inline, everything else by cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Pid(u64),
    Obj(ObjRef),
}

// Safety: immediates are plain data; Obj carries its own Send/Sync story.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

/// Variant tag of a value, covering immediates and every payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Nil,
    Bool,
    Int,
    Float,
    Pid,
    Str,
    Bytes,
    Vector,
    Array,
    Map,
    Function,
    Closure,
    Struct,
    Enum,
    Option,
    Result,
}

impl ValueKind {
    /// Stable lowercase name used in diagnostics and type errors
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Pid => "pid",
            ValueKind::Str => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Vector => "vector",
            ValueKind::Array => "array",
            ValueKind::Map => "map",
            ValueKind::Function => "function",
            ValueKind::Closure => "closure",
            ValueKind::Struct => "struct",
            ValueKind::Enum => "enum",
            ValueKind::Option => "option",
            ValueKind::Result => "result",
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Pid(_) => ValueKind::Pid,
            // Safety: holding this Value means holding a reference
            Value::Obj(r) => match unsafe { r.as_obj().payload() } {
                ObjPayload::Str(_) => ValueKind::Str,
                ObjPayload::Bytes(_) => ValueKind::Bytes,
                ObjPayload::Vector(_) => ValueKind::Vector,
                ObjPayload::Array(_) => ValueKind::Array,
                ObjPayload::Map(_) => ValueKind::Map,
                ObjPayload::Function(_) => ValueKind::Function,
                ObjPayload::Closure(_) => ValueKind::Closure,
                ObjPayload::Struct(_) => ValueKind::Struct,
                ObjPayload::Enum(_) => ValueKind::Enum,
                ObjPayload::Opt(_) => ValueKind::Option,
                ObjPayload::Res(_) => ValueKind::Result,
                ObjPayload::Freed => ValueKind::Nil,
            },
        }
    }

    #[inline]
    pub fn obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    /// Conditionals require a bool; everything else is a type error in the VM.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            // Safety: live reference held by caller
            Value::Obj(r) => match unsafe { r.as_obj().payload() } {
                ObjPayload::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }
}

// =============================================================================
// Retain / release
// =============================================================================

/// Try to take another reference to `v`.
///
/// Immediates are trivially retainable. `SATURATED` cells are returned
/// unchanged. A cell observed at `FREEING` or 0 is already dead: the retain
/// fails and the caller must treat the value as gone.
pub fn retain(v: Value) -> bool {
    let Value::Obj(r) = v else { return true };
    let rc = &r.as_obj().header.refcount;
    let mut current = rc.load(Ordering::Acquire);
    loop {
        match current {
            RC_SATURATED => return true,
            RC_FREEING | 0 => return false,
            n => {
                let next = if n >= RC_MAX_ORDINARY { RC_SATURATED } else { n + 1 };
                match rc.compare_exchange_weak(n, next, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return true,
                    Err(observed) => current = observed,
                }
            }
        }
    }
}

/// Drop one reference to `v`, destroying the payload when the last
/// reference dies. The cell itself is reclaimed by its owning heap's sweep
/// (heapless cells are deallocated immediately).
pub fn release(v: Value) {
    let Value::Obj(r) = v else { return };
    if release_ref_only(r) {
        // Safety: the 1 -> FREEING transition succeeded; we are the sole
        // destroyer.
        unsafe { destroy(r.0) };
    }
}

/// Decrement the refcount; returns true if the caller won the
/// `1 -> FREEING` transition and must destroy the payload.
fn release_ref_only(r: ObjRef) -> bool {
    let rc = &r.as_obj().header.refcount;
    let mut current = rc.load(Ordering::Acquire);
    loop {
        match current {
            RC_SATURATED => return false,
            RC_FREEING | 0 => {
                debug_assert!(false, "release on a dead cell");
                return false;
            }
            1 => {
                match rc.compare_exchange_weak(1, RC_FREEING, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return true,
                    Err(observed) => current = observed,
                }
            }
            n => match rc.compare_exchange_weak(n, n - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return false,
                Err(observed) => current = observed,
            },
        }
    }
}

/// Destroy a cell's payload, iteratively releasing children.
///
/// A worklist replaces recursion so deeply nested containers cannot
/// overflow the native stack. Heapless cells are deallocated here; cells
/// on a heap's allocation list become tombstones for the sweep.
///
/// # Safety
/// The caller must have won the `1 -> FREEING` CAS for `obj`.
unsafe fn destroy(obj: *mut Obj) {
    let mut worklist: Vec<*mut Obj> = vec![obj];
    while let Some(p) = worklist.pop() {
        // Safety: each pointer on the worklist won its FREEING transition.
        let cell = unsafe { &*p };
        let payload = std::mem::replace(unsafe { cell.payload_mut() }, ObjPayload::Freed);
        payload.for_each_child(|child| {
            if let Value::Obj(cr) = child {
                if release_ref_only(cr) {
                    worklist.push(cr.0);
                }
            }
        });
        drop(payload);
        if cell.header.owner == HEAP_NONE {
            // Safety: heapless cells were minted via Box::into_raw and are
            // not on any allocation list.
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

/// Free an interned (`SATURATED`) cell outright. Used by chunk teardown
/// for pool constants that were never handed to a heap.
///
/// # Safety
/// No live references to the cell may remain.
pub unsafe fn free_interned(r: ObjRef) {
    let cell = r.as_obj();
    debug_assert_eq!(cell.refcount(), RC_SATURATED);
    debug_assert_eq!(cell.header.owner, HEAP_NONE);
    let payload = std::mem::replace(unsafe { cell.payload_mut() }, ObjPayload::Freed);
    payload.for_each_child(release);
    drop(payload);
    // Safety: minted via Box::into_raw, not heap-tracked.
    drop(unsafe { Box::from_raw(r.0) });
}

/// Flag a value graph as shared across owners (message passing). Every
/// reachable mutable container gets `COW_SHARED`, so a mutation by any
/// owner clones before writing. Immutable payloads need no flag. A visited
/// set guards against reference cycles.
pub fn mark_shared(v: Value) {
    let Value::Obj(root) = v else { return };
    let mut seen = std::collections::HashSet::new();
    let mut worklist = vec![root];
    while let Some(r) = worklist.pop() {
        if !seen.insert(r.0 as usize) {
            continue;
        }
        let obj = r.as_obj();
        if !obj.flags().contains(ValueFlags::IMMUTABLE) {
            obj.set_flag(ValueFlags::COW_SHARED);
        }
        // Safety: the sender holds a live reference to the whole graph.
        unsafe { obj.payload() }.for_each_child(|child| {
            if let Value::Obj(cr) = child {
                worklist.push(cr);
            }
        });
    }
}

// =============================================================================
// Equality, ordering, hashing
// =============================================================================

/// Structural equality. Floats are IEEE-754 (`NaN != NaN`); int/float
/// compare numerically; different top-level variants never compare equal
/// apart from that numeric exception.
pub fn value_eq(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => x as f64 == y,
        (Value::Pid(x), Value::Pid(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => {
            if x.0 == y.0 {
                return true;
            }
            // Safety: both references are live.
            let (px, py) = unsafe { (x.as_obj().payload(), y.as_obj().payload()) };
            payload_eq(px, py)
        }
        _ => false,
    }
}

fn payload_eq(a: &ObjPayload, b: &ObjPayload) -> bool {
    match (a, b) {
        (ObjPayload::Str(x), ObjPayload::Str(y)) => x == y,
        (ObjPayload::Bytes(x), ObjPayload::Bytes(y)) => x == y,
        (ObjPayload::Vector(x), ObjPayload::Vector(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| a == b)
        }
        (ObjPayload::Array(x), ObjPayload::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(&a, &b)| value_eq(a, b))
        }
        (ObjPayload::Map(x), ObjPayload::Map(y)) => x.structural_eq(y, value_eq),
        (ObjPayload::Function(x), ObjPayload::Function(y)) => x.fn_index == y.fn_index,
        // Closures compare by identity only, handled by the pointer check
        (ObjPayload::Closure(_), ObjPayload::Closure(_)) => false,
        (ObjPayload::Struct(x), ObjPayload::Struct(y)) => {
            x.type_name == y.type_name
                && x.fields.len() == y.fields.len()
                && x.fields
                    .iter()
                    .zip(y.fields.iter())
                    .all(|((na, va), (nb, vb))| na == nb && value_eq(*va, *vb))
        }
        (ObjPayload::Enum(x), ObjPayload::Enum(y)) => {
            x.type_name == y.type_name
                && x.variant == y.variant
                && match (x.payload, y.payload) {
                    (None, None) => true,
                    (Some(va), Some(vb)) => value_eq(va, vb),
                    _ => false,
                }
        }
        (ObjPayload::Opt(x), ObjPayload::Opt(y)) => match (x, y) {
            (None, None) => true,
            (Some(va), Some(vb)) => value_eq(*va, *vb),
            _ => false,
        },
        (ObjPayload::Res(x), ObjPayload::Res(y)) => {
            x.is_ok == y.is_ok && value_eq(x.inner, y.inner)
        }
        _ => false,
    }
}

/// Ordering for same-type numerics (with the int/float mix), and strings.
/// Anything else is a type error: `None`.
pub fn value_cmp(a: Value, b: Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(&y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(&y),
        (Value::Int(x), Value::Float(y)) => (x as f64).partial_cmp(&y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(y as f64)),
        (Value::Obj(x), Value::Obj(y)) => {
            // Safety: both references are live.
            match unsafe { (x.as_obj().payload(), y.as_obj().payload()) } {
                (ObjPayload::Str(sx), ObjPayload::Str(sy)) => Some(sx.as_str().cmp(sy.as_str())),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Hash a value: FNV-1a for strings (precomputed), byte hashes for the
/// other immediates, identity for collections.
pub fn value_hash(v: Value) -> u64 {
    match v {
        Value::Nil => 0,
        Value::Bool(b) => 1 + b as u64,
        Value::Int(n) => fnv1a(&n.to_le_bytes()),
        Value::Float(f) => fnv1a(&f.to_bits().to_le_bytes()),
        Value::Pid(p) => fnv1a(&p.to_le_bytes()),
        Value::Obj(r) => {
            // Safety: live reference held by caller
            match unsafe { r.as_obj().payload() } {
                ObjPayload::Str(s) => s.hash(),
                _ => r.identity() as u64,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_cell(s: &str) -> Value {
        Value::Obj(Obj::intern(ObjPayload::Str(BlocString::new(s))))
    }

    #[test]
    fn test_immediate_kinds() {
        assert_eq!(Value::Nil.kind(), ValueKind::Nil);
        assert_eq!(Value::Bool(true).kind(), ValueKind::Bool);
        assert_eq!(Value::Int(5).kind(), ValueKind::Int);
        assert_eq!(Value::Float(1.5).kind(), ValueKind::Float);
        assert_eq!(Value::Pid(9).kind(), ValueKind::Pid);
    }

    #[test]
    fn test_retain_immediates_trivially_succeed() {
        assert!(retain(Value::Nil));
        assert!(retain(Value::Int(42)));
        release(Value::Nil);
        release(Value::Int(42));
    }

    #[test]
    fn test_saturated_retain_release_noop() {
        let v = str_cell("pinned");
        let r = v.obj().expect("cell");
        assert!(retain(v));
        release(v);
        release(v);
        assert_eq!(r.as_obj().refcount(), RC_SATURATED);
        unsafe { free_interned(r) };
    }

    #[test]
    fn test_refcount_last_release_destroys() {
        let boxed = Obj::new(ObjPayload::Bytes(vec![1, 2, 3]), HEAP_NONE);
        let r = ObjRef(Box::into_raw(boxed));
        let v = Value::Obj(r);
        assert!(retain(v));
        assert_eq!(r.as_obj().refcount(), 2);
        release(v);
        assert_eq!(r.as_obj().refcount(), 1);
        // Last release destroys and (heapless) deallocates; no further
        // access to r after this point.
        release(v);
    }

    #[test]
    fn test_retain_refuses_dead_cell() {
        let boxed = Obj::new(ObjPayload::Bytes(vec![]), HEAP_NONE);
        // Simulate a cell claimed for destruction
        boxed.header.refcount.store(RC_FREEING, Ordering::Release);
        let raw = Box::into_raw(boxed);
        let v = Value::Obj(ObjRef(raw));
        assert!(!retain(v));
        // Manual cleanup of the leaked test cell
        unsafe { drop(Box::from_raw(raw)) };
    }

    #[test]
    fn test_eq_numeric_mixed() {
        assert!(value_eq(Value::Int(3), Value::Float(3.0)));
        assert!(value_eq(Value::Float(3.0), Value::Int(3)));
        assert!(!value_eq(Value::Int(3), Value::Float(3.5)));
    }

    #[test]
    fn test_eq_nan_is_not_equal() {
        assert!(!value_eq(Value::Float(f64::NAN), Value::Float(f64::NAN)));
    }

    #[test]
    fn test_eq_different_variants() {
        assert!(!value_eq(Value::Nil, Value::Bool(false)));
        assert!(!value_eq(Value::Int(0), Value::Bool(false)));
    }

    #[test]
    fn test_eq_strings_bytewise() {
        let a = str_cell("abc");
        let b = str_cell("abc");
        let c = str_cell("abd");
        assert!(value_eq(a, b));
        assert!(!value_eq(a, c));
        for v in [a, b, c] {
            unsafe { free_interned(v.obj().expect("cell")) };
        }
    }

    #[test]
    fn test_cmp_numeric_and_string() {
        assert_eq!(value_cmp(Value::Int(1), Value::Int(2)), Some(CmpOrdering::Less));
        assert_eq!(
            value_cmp(Value::Float(2.5), Value::Int(2)),
            Some(CmpOrdering::Greater)
        );
        let a = str_cell("apple");
        let b = str_cell("banana");
        assert_eq!(value_cmp(a, b), Some(CmpOrdering::Less));
        assert_eq!(value_cmp(a, Value::Int(1)), None);
        for v in [a, b] {
            unsafe { free_interned(v.obj().expect("cell")) };
        }
    }

    #[test]
    fn test_hash_string_uses_precomputed() {
        let a = str_cell("key");
        assert_eq!(value_hash(a), crate::hash::fnv1a_str("key"));
        unsafe { free_interned(a.obj().expect("cell")) };
    }
}
