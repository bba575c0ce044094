//! Container operations
//!
//! Allocation and mutation of arrays, maps, bytes, and the composite
//! values, with the copy-on-write discipline of the value model:
//!
//! - A container observed as shared (refcount above 1, or flagged
//!   `COW_SHARED` by message passing) is never mutated in place. The
//!   operation clones the container (retaining each element into the
//!   clone), releases the caller's reference to the original, and returns
//!   the clone. The other owners keep seeing the untouched original.
//! - An exclusively owned container mutates in place; old→young stores go
//!   through the write barrier.
//!
//! All allocation goes through the thread-local current heap installed by
//! the worker (see `heap::install`), so these functions mirror the way the
//! VM reaches them: no heap handle threads through the opcode handlers.

use crate::heap;
use crate::strings::BlocString;
use crate::value::{
    ClosureData, EnumData, Obj, ObjPayload, ObjRef, ResultData, StructData, Value, ValueFlags,
    release, retain,
};

/// Failure of a container operation; the VM maps these onto its error
/// taxonomy (`NoHeap` becomes a runtime error, the rest type errors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// No current heap installed on this thread
    NoHeap,
    /// Operand had the wrong variant
    Type { expected: &'static str, got: &'static str },
    /// The value is being destroyed and cannot be retained
    Dead,
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::NoHeap => write!(f, "no current heap installed"),
            OpError::Type { expected, got } => {
                write!(f, "expected {expected}, got {got}")
            }
            OpError::Dead => write!(f, "value is already being destroyed"),
        }
    }
}

impl std::error::Error for OpError {}

fn alloc(payload: ObjPayload) -> Result<Value, OpError> {
    heap::with(|h| h.alloc(payload)).ok_or(OpError::NoHeap)
}

fn type_error(expected: &'static str, got: Value) -> OpError {
    OpError::Type {
        expected,
        got: got.kind().name(),
    }
}

/// Whether mutation must clone first
#[inline]
fn needs_cow(obj: &Obj) -> bool {
    obj.refcount() > 1 || obj.flags().contains(ValueFlags::COW_SHARED)
}

/// Clone a container cell ahead of mutation: new cell, new payload, each
/// element retained. Releases the caller's reference to the original and
/// returns the clone, which is exclusively owned.
fn cow_clone(r: ObjRef) -> Result<Value, OpError> {
    // Safety: caller holds a live reference.
    let cloned = match unsafe { r.as_obj().payload() } {
        ObjPayload::Array(items) => {
            for &item in items {
                if !retain(item) {
                    return Err(OpError::Dead);
                }
            }
            ObjPayload::Array(items.clone())
        }
        ObjPayload::Map(map) => ObjPayload::Map(map.clone_with(|v| {
            retain(v);
            v
        })),
        ObjPayload::Bytes(bytes) => ObjPayload::Bytes(bytes.clone()),
        other => {
            return Err(OpError::Type {
                expected: "array, map, or bytes",
                got: payload_kind_name(other),
            });
        }
    };
    let fresh = alloc(cloned)?;
    release(Value::Obj(r));
    Ok(fresh)
}

fn payload_kind_name(p: &ObjPayload) -> &'static str {
    match p {
        ObjPayload::Str(_) => "string",
        ObjPayload::Bytes(_) => "bytes",
        ObjPayload::Vector(_) => "vector",
        ObjPayload::Array(_) => "array",
        ObjPayload::Map(_) => "map",
        ObjPayload::Function(_) => "function",
        ObjPayload::Closure(_) => "closure",
        ObjPayload::Struct(_) => "struct",
        ObjPayload::Enum(_) => "enum",
        ObjPayload::Opt(_) => "option",
        ObjPayload::Res(_) => "result",
        ObjPayload::Freed => "freed",
    }
}

/// Resolve a value to a mutable container cell, cloning first if shared.
/// Returns the (possibly new) value the caller now owns.
fn writable(v: Value, expected: &'static str) -> Result<ObjRef, OpError> {
    let r = v.obj().ok_or_else(|| type_error(expected, v))?;
    if needs_cow(r.as_obj()) {
        let fresh = cow_clone(r)?;
        Ok(fresh.obj().expect("cow clone is a cell"))
    } else {
        Ok(r)
    }
}

// =============================================================================
// Constructors
// =============================================================================

pub fn string_new(s: &str) -> Result<Value, OpError> {
    alloc(ObjPayload::Str(BlocString::new(s)))
}

pub fn bytes_new(data: Vec<u8>) -> Result<Value, OpError> {
    alloc(ObjPayload::Bytes(data))
}

pub fn vector_new(data: Vec<f64>) -> Result<Value, OpError> {
    alloc(ObjPayload::Vector(data.into_boxed_slice()))
}

pub fn array_new() -> Result<Value, OpError> {
    alloc(ObjPayload::Array(Vec::new()))
}

pub fn map_new() -> Result<Value, OpError> {
    alloc(ObjPayload::Map(crate::map::RawMap::new()))
}

pub fn closure_new(fn_index: u32, arity: u8, upvalues: Vec<Value>) -> Result<Value, OpError> {
    alloc(ObjPayload::Closure(ClosureData {
        fn_index,
        arity,
        upvalues,
    }))
}

pub fn struct_new(type_name: &str, fields: Vec<(String, Value)>) -> Result<Value, OpError> {
    alloc(ObjPayload::Struct(StructData {
        type_name: type_name.to_string(),
        fields,
    }))
}

pub fn enum_new(type_name: &str, variant: &str, payload: Option<Value>) -> Result<Value, OpError> {
    alloc(ObjPayload::Enum(EnumData {
        type_name: type_name.to_string(),
        variant: variant.to_string(),
        payload,
    }))
}

pub fn some_new(v: Value) -> Result<Value, OpError> {
    alloc(ObjPayload::Opt(Some(v)))
}

pub fn none_new() -> Result<Value, OpError> {
    alloc(ObjPayload::Opt(None))
}

pub fn ok_new(v: Value) -> Result<Value, OpError> {
    alloc(ObjPayload::Res(ResultData { is_ok: true, inner: v }))
}

pub fn err_new(v: Value) -> Result<Value, OpError> {
    alloc(ObjPayload::Res(ResultData {
        is_ok: false,
        inner: v,
    }))
}

// =============================================================================
// Arrays
// =============================================================================

/// Append, taking ownership of `arr` and `item`; returns the array the
/// caller now owns (a clone when `arr` was shared).
pub fn array_push(arr: Value, item: Value) -> Result<Value, OpError> {
    let r = writable(arr, "array")?;
    // Safety: `writable` guarantees exclusive ownership.
    let ObjPayload::Array(items) = (unsafe { r.as_obj().payload_mut() }) else {
        return Err(type_error("array", Value::Obj(r)));
    };
    items.push(item);
    heap::with(|h| {
        h.write_barrier(r, item);
        h.recharge(r);
    });
    Ok(Value::Obj(r))
}

/// Index read; out-of-range yields nil, never a trap. The returned value
/// is retained for the caller.
pub fn array_get(arr: Value, index: i64) -> Result<Value, OpError> {
    let r = arr.obj().ok_or_else(|| type_error("array", arr))?;
    // Safety: live reference.
    let ObjPayload::Array(items) = (unsafe { r.as_obj().payload() }) else {
        return Err(type_error("array", arr));
    };
    if index < 0 {
        return Ok(Value::Nil);
    }
    match items.get(index as usize) {
        Some(&v) => {
            if !retain(v) {
                return Err(OpError::Dead);
            }
            Ok(v)
        }
        None => Ok(Value::Nil),
    }
}

/// Index write with COW; the displaced element is released. Writing past
/// the end is a no-op returning the array unchanged (reads of those
/// indices yield nil anyway).
pub fn array_set(arr: Value, index: i64, item: Value) -> Result<Value, OpError> {
    let r = writable(arr, "array")?;
    // Safety: exclusive ownership via `writable`.
    let ObjPayload::Array(items) = (unsafe { r.as_obj().payload_mut() }) else {
        return Err(type_error("array", Value::Obj(r)));
    };
    if index >= 0 && (index as usize) < items.len() {
        let old = std::mem::replace(&mut items[index as usize], item);
        release(old);
        heap::with(|h| h.write_barrier(r, item));
    } else {
        release(item);
    }
    Ok(Value::Obj(r))
}

pub fn array_len(arr: Value) -> Result<i64, OpError> {
    let r = arr.obj().ok_or_else(|| type_error("array", arr))?;
    // Safety: live reference.
    match unsafe { r.as_obj().payload() } {
        ObjPayload::Array(items) => Ok(items.len() as i64),
        _ => Err(type_error("array", arr)),
    }
}

// =============================================================================
// Maps
// =============================================================================

/// Key read; a missing key yields nil. The returned value is retained.
pub fn map_get(map: Value, key: &BlocString) -> Result<Value, OpError> {
    let r = map.obj().ok_or_else(|| type_error("map", map))?;
    // Safety: live reference.
    let ObjPayload::Map(table) = (unsafe { r.as_obj().payload() }) else {
        return Err(type_error("map", map));
    };
    match table.get(key) {
        Some(v) => {
            if !retain(v) {
                return Err(OpError::Dead);
            }
            Ok(v)
        }
        None => Ok(Value::Nil),
    }
}

/// Insert or replace with COW; the displaced value is released. Takes
/// ownership of `map` and `item`, returns the map the caller now owns.
pub fn map_set(map: Value, key: &BlocString, item: Value) -> Result<Value, OpError> {
    let r = writable(map, "map")?;
    // Safety: exclusive ownership via `writable`.
    let ObjPayload::Map(table) = (unsafe { r.as_obj().payload_mut() }) else {
        return Err(type_error("map", Value::Obj(r)));
    };
    if let Some(old) = table.insert(key.clone(), item) {
        release(old);
    }
    heap::with(|h| {
        h.write_barrier(r, item);
        h.recharge(r);
    });
    Ok(Value::Obj(r))
}

/// Remove with COW; the removed value is released. Returns the map.
pub fn map_remove(map: Value, key: &BlocString) -> Result<Value, OpError> {
    let r = writable(map, "map")?;
    // Safety: exclusive ownership via `writable`.
    let ObjPayload::Map(table) = (unsafe { r.as_obj().payload_mut() }) else {
        return Err(type_error("map", Value::Obj(r)));
    };
    if let Some(old) = table.remove(key) {
        release(old);
    }
    Ok(Value::Obj(r))
}

pub fn map_has(map: Value, key: &BlocString) -> Result<bool, OpError> {
    let r = map.obj().ok_or_else(|| type_error("map", map))?;
    // Safety: live reference.
    match unsafe { r.as_obj().payload() } {
        ObjPayload::Map(table) => Ok(table.contains_key(key)),
        _ => Err(type_error("map", map)),
    }
}

pub fn map_len(map: Value) -> Result<i64, OpError> {
    let r = map.obj().ok_or_else(|| type_error("map", map))?;
    // Safety: live reference.
    match unsafe { r.as_obj().payload() } {
        ObjPayload::Map(table) => Ok(table.len() as i64),
        _ => Err(type_error("map", map)),
    }
}

// =============================================================================
// Bytes
// =============================================================================

/// Append bytes with COW
pub fn bytes_append(bytes: Value, more: &[u8]) -> Result<Value, OpError> {
    let r = writable(bytes, "bytes")?;
    // Safety: exclusive ownership via `writable`.
    let ObjPayload::Bytes(buf) = (unsafe { r.as_obj().payload_mut() }) else {
        return Err(type_error("bytes", Value::Obj(r)));
    };
    buf.extend_from_slice(more);
    heap::with(|h| h.recharge(r));
    Ok(Value::Obj(r))
}

// =============================================================================
// Generic operations
// =============================================================================

/// Length of a string (code points), bytes, vector, array, or map
pub fn length(v: Value) -> Result<i64, OpError> {
    let r = v
        .obj()
        .ok_or_else(|| type_error("string, bytes, vector, array, or map", v))?;
    // Safety: live reference.
    match unsafe { r.as_obj().payload() } {
        ObjPayload::Str(s) => Ok(s.chars() as i64),
        ObjPayload::Bytes(b) => Ok(b.len() as i64),
        ObjPayload::Vector(x) => Ok(x.len() as i64),
        ObjPayload::Array(a) => Ok(a.len() as i64),
        ObjPayload::Map(m) => Ok(m.len() as i64),
        _ => Err(type_error("string, bytes, vector, array, or map", v)),
    }
}

/// Concatenate two strings, two arrays, or two bytes values into a fresh
/// allocation. Operands keep their references (caller releases).
pub fn concat(a: Value, b: Value) -> Result<Value, OpError> {
    let (ra, rb) = match (a.obj(), b.obj()) {
        (Some(ra), Some(rb)) => (ra, rb),
        _ => return Err(type_error("string, array, or bytes", a)),
    };
    // Safety: live references.
    match unsafe { (ra.as_obj().payload(), rb.as_obj().payload()) } {
        (ObjPayload::Str(x), ObjPayload::Str(y)) => {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x.as_str());
            s.push_str(y.as_str());
            alloc(ObjPayload::Str(BlocString::new(s)))
        }
        (ObjPayload::Array(x), ObjPayload::Array(y)) => {
            let mut items = Vec::with_capacity(x.len() + y.len());
            for &v in x.iter().chain(y.iter()) {
                if !retain(v) {
                    return Err(OpError::Dead);
                }
                items.push(v);
            }
            alloc(ObjPayload::Array(items))
        }
        (ObjPayload::Bytes(x), ObjPayload::Bytes(y)) => {
            let mut buf = Vec::with_capacity(x.len() + y.len());
            buf.extend_from_slice(x);
            buf.extend_from_slice(y);
            alloc(ObjPayload::Bytes(buf))
        }
        _ => Err(type_error("matching string, array, or bytes", b)),
    }
}

/// The value's type name as a fresh string value
pub fn type_of(v: Value) -> Result<Value, OpError> {
    string_new(v.kind().name())
}

/// Deep-copy failure reasons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyError {
    /// Closures capture code and are not copyable
    Closure,
    Op(OpError),
}

impl From<OpError> for CopyError {
    fn from(e: OpError) -> Self {
        CopyError::Op(e)
    }
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Closure => write!(f, "closures cannot be copied"),
            CopyError::Op(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CopyError {}

/// Structural deep copy into the current heap. Immutable payloads
/// (strings, vectors, functions) are shared by retain; containers and
/// composites are rebuilt; closures are not copyable.
pub fn value_copy(v: Value) -> Result<Value, CopyError> {
    let Value::Obj(r) = v else { return Ok(v) };
    // Safety: live reference.
    match unsafe { r.as_obj().payload() } {
        ObjPayload::Str(_) | ObjPayload::Vector(_) | ObjPayload::Function(_) => {
            if !retain(v) {
                return Err(CopyError::Op(OpError::Dead));
            }
            Ok(v)
        }
        ObjPayload::Bytes(b) => Ok(alloc(ObjPayload::Bytes(b.clone()))?),
        ObjPayload::Array(items) => {
            let mut copied = Vec::with_capacity(items.len());
            for &item in items {
                copied.push(value_copy(item)?);
            }
            Ok(alloc(ObjPayload::Array(copied))?)
        }
        ObjPayload::Map(table) => {
            let mut fresh = crate::map::RawMap::new();
            for entry in table.entries() {
                fresh.insert(entry.key.clone(), value_copy(entry.value)?);
            }
            Ok(alloc(ObjPayload::Map(fresh))?)
        }
        ObjPayload::Closure(_) => Err(CopyError::Closure),
        ObjPayload::Struct(s) => {
            let mut fields = Vec::with_capacity(s.fields.len());
            for (name, fv) in &s.fields {
                fields.push((name.clone(), value_copy(*fv)?));
            }
            Ok(alloc(ObjPayload::Struct(StructData {
                type_name: s.type_name.clone(),
                fields,
            }))?)
        }
        ObjPayload::Enum(e) => {
            let payload = match e.payload {
                Some(p) => Some(value_copy(p)?),
                None => None,
            };
            Ok(alloc(ObjPayload::Enum(EnumData {
                type_name: e.type_name.clone(),
                variant: e.variant.clone(),
                payload,
            }))?)
        }
        ObjPayload::Opt(inner) => {
            let copied = match inner {
                Some(p) => Some(value_copy(*p)?),
                None => None,
            };
            Ok(alloc(ObjPayload::Opt(copied))?)
        }
        ObjPayload::Res(res) => {
            let inner = value_copy(res.inner)?;
            Ok(alloc(ObjPayload::Res(ResultData {
                is_ok: res.is_ok,
                inner,
            }))?)
        }
        ObjPayload::Freed => Err(CopyError::Op(OpError::Dead)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{DEFAULT_MAX_HEAP, Heap, install};
    use crate::value::{ValueKind, value_eq};

    fn run(f: impl FnOnce()) {
        let mut heap = Heap::new(DEFAULT_MAX_HEAP);
        let _guard = install(&mut heap);
        f();
    }

    #[test]
    fn test_array_push_and_get() {
        run(|| {
            let arr = array_new().expect("alloc");
            let arr = array_push(arr, Value::Int(10)).expect("push");
            let arr = array_push(arr, Value::Int(20)).expect("push");
            assert_eq!(array_len(arr).expect("len"), 2);
            assert_eq!(array_get(arr, 0).expect("get"), Value::Int(10));
            assert_eq!(array_get(arr, 1).expect("get"), Value::Int(20));
            release(arr);
        });
    }

    #[test]
    fn test_array_get_out_of_range_is_nil() {
        run(|| {
            let arr = array_push(array_new().expect("alloc"), Value::Int(1)).expect("push");
            assert_eq!(array_get(arr, 5).expect("get"), Value::Nil);
            assert_eq!(array_get(arr, -1).expect("get"), Value::Nil);
            release(arr);
        });
    }

    #[test]
    fn test_array_cow_on_shared() {
        run(|| {
            let a1 = array_push(array_new().expect("alloc"), Value::Int(1)).expect("push");
            assert!(retain(a1)); // second owner
            let a2 = array_set(a1, 0, Value::Int(2)).expect("set");
            // a1's payload is untouched; a2 is a fresh cell
            assert_ne!(a1.obj().map(|r| r.identity()), a2.obj().map(|r| r.identity()));
            assert_eq!(array_get(a1, 0).expect("get"), Value::Int(1));
            assert_eq!(array_get(a2, 0).expect("get"), Value::Int(2));
            release(a1);
            release(a2);
        });
    }

    #[test]
    fn test_map_cow_on_shared() {
        run(|| {
            let key = BlocString::new("x");
            let m1 = map_set(map_new().expect("alloc"), &key, Value::Int(1)).expect("set");
            assert!(retain(m1));
            let m2 = map_set(m1, &key, Value::Int(2)).expect("set");
            assert_eq!(map_get(m1, &key).expect("get"), Value::Int(1));
            assert_eq!(map_get(m2, &key).expect("get"), Value::Int(2));
            release(m1);
            release(m2);
        });
    }

    #[test]
    fn test_map_missing_key_is_nil() {
        run(|| {
            let m = map_new().expect("alloc");
            assert_eq!(map_get(m, &BlocString::new("nope")).expect("get"), Value::Nil);
            release(m);
        });
    }

    #[test]
    fn test_in_place_mutation_when_exclusive() {
        run(|| {
            let arr = array_push(array_new().expect("alloc"), Value::Int(1)).expect("push");
            let identity = arr.obj().expect("cell").identity();
            let arr = array_push(arr, Value::Int(2)).expect("push");
            assert_eq!(arr.obj().expect("cell").identity(), identity);
            release(arr);
        });
    }

    #[test]
    fn test_cow_shared_flag_forces_clone() {
        run(|| {
            let arr = array_push(array_new().expect("alloc"), Value::Int(1)).expect("push");
            arr.obj().expect("cell").as_obj().set_flag(ValueFlags::COW_SHARED);
            let identity = arr.obj().expect("cell").identity();
            let arr2 = array_push(arr, Value::Int(2)).expect("push");
            assert_ne!(arr2.obj().expect("cell").identity(), identity);
            release(arr2);
        });
    }

    #[test]
    fn test_concat_strings() {
        run(|| {
            let a = string_new("foo").expect("alloc");
            let b = string_new("bar").expect("alloc");
            let c = concat(a, b).expect("concat");
            assert_eq!(c.as_str(), Some("foobar"));
            release(a);
            release(b);
            release(c);
        });
    }

    #[test]
    fn test_concat_type_mismatch() {
        run(|| {
            let a = string_new("foo").expect("alloc");
            let b = array_new().expect("alloc");
            assert!(concat(a, b).is_err());
            release(a);
            release(b);
        });
    }

    #[test]
    fn test_length() {
        run(|| {
            let s = string_new("héllo").expect("alloc");
            assert_eq!(length(s).expect("len"), 5);
            release(s);
            assert!(length(Value::Int(3)).is_err());
        });
    }

    #[test]
    fn test_value_copy_structural_eq() {
        run(|| {
            let key = BlocString::new("k");
            let inner = array_push(array_new().expect("alloc"), Value::Int(7)).expect("push");
            let m = map_set(map_new().expect("alloc"), &key, inner).expect("set");
            let copy = value_copy(m).expect("copy");
            assert!(value_eq(m, copy));
            assert_ne!(m.obj().map(|r| r.identity()), copy.obj().map(|r| r.identity()));
            release(m);
            release(copy);
        });
    }

    #[test]
    fn test_value_copy_closure_unsupported() {
        run(|| {
            let c = closure_new(0, 0, Vec::new()).expect("alloc");
            assert_eq!(value_copy(c), Err(CopyError::Closure));
            release(c);
        });
    }

    #[test]
    fn test_map_has_and_remove() {
        run(|| {
            let key = BlocString::new("k");
            let m = map_set(map_new().expect("alloc"), &key, Value::Int(1)).expect("set");
            assert!(map_has(m, &key).expect("has"));
            assert_eq!(map_len(m).expect("len"), 1);
            let m = map_remove(m, &key).expect("remove");
            assert!(!map_has(m, &key).expect("has"));
            assert_eq!(map_get(m, &key).expect("get"), Value::Nil);
            release(m);
        });
    }

    #[test]
    fn test_bytes_append_cow() {
        run(|| {
            let b1 = bytes_new(vec![1, 2]).expect("alloc");
            assert!(retain(b1)); // shared
            let b2 = bytes_append(b1, &[3, 4]).expect("append");
            assert_eq!(length(b1).expect("len"), 2);
            assert_eq!(length(b2).expect("len"), 4);
            release(b1);
            release(b2);
        });
    }

    #[test]
    fn test_vector_value() {
        run(|| {
            let v = vector_new(vec![3.0, 4.0]).expect("alloc");
            assert_eq!(v.kind(), ValueKind::Vector);
            assert_eq!(length(v).expect("len"), 2);
            release(v);
        });
    }

    #[test]
    fn test_no_heap_is_an_error() {
        assert_eq!(array_new(), Err(OpError::NoHeap));
    }
}
