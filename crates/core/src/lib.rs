//! Bloc Core: the value world of the Bloc runtime
//!
//! This crate holds everything a block's virtual machine computes *with*:
//! the tagged `Value` model with refcounted, copy-on-write heap cells; the
//! per-block generational heap and its tracing collector; the NaN-boxed
//! 8-byte encoding the register VM runs on; bytecode chunks; and the
//! inline cache for map field loads.
//!
//! Key design principles:
//! - `Value`: immediates inline, containers behind refcounted cells
//! - Ownership is explicit: every stored reference owns a refcount, and
//!   `retain`/`release` are the only way references move
//! - The heap is per-block and single-mutator; sharing across blocks goes
//!   through message passing and copy-on-write, never through locks
//!
//! # Modules
//!
//! - `hash`: FNV-1a, hash combine, shape hashing
//! - `strings`: immutable string payload with a precomputed hash
//! - `value`: the `Value` sum, heap cells, refcount protocol, equality
//! - `map`: separately chained string-keyed hash table
//! - `vector`: dense f64 numeric kernels
//! - `containers`: COW-aware container operations on the current heap
//! - `heap`: allocation list, write barrier, remembered set, card table
//! - `gc`: tri-color marking, incremental stepping, refcount-aware sweep
//! - `nanbox`: 64-bit NaN-boxed value encoding
//! - `cache`: inline cache for map field loads
//! - `chunk`: opcodes, bytecode chunks, constant pools, wire format
//! - `json`: JSON representation of values

pub mod cache;
pub mod chunk;
pub mod containers;
pub mod gc;
pub mod hash;
pub mod heap;
pub mod json;
pub mod map;
pub mod nanbox;
pub mod strings;
pub mod value;
pub mod vector;

// Re-export key types and functions
pub use cache::{CacheState, InlineCache};
pub use chunk::{Bytecode, Chunk, ChunkError, FunctionChunk, Op, load_constant};
pub use containers::{CopyError, OpError, value_copy};
pub use gc::CollectResult;
pub use heap::{Heap, HeapStats};
pub use nanbox::NanBox;
pub use strings::BlocString;
pub use value::{
    ClosureData, EnumData, FunctionData, Obj, ObjPayload, ObjRef, ResultData, StructData, Value,
    ValueFlags, ValueKind, mark_shared, release, retain, value_cmp, value_eq, value_hash,
};
