//! Stack VM
//!
//! Frame-chained stack machine over the bytecode in `bloc_core::chunk`.
//! One VM belongs to one block and persists across scheduling slices: when
//! a slice ends in a yield or a park, the operand stack and frame chain
//! stay put and the next slice resumes mid-program.
//!
//! ## Ownership
//!
//! Operand-stack slots own references. Pushing a constant retains it,
//! `DUP` retains, discarding releases. Frame teardown releases every slot
//! above the frame base. The VM's heap is reached through the thread-local
//! current heap installed by the block around each slice.
//!
//! ## Suspension
//!
//! The dispatch loop leaves only at explicit points: `HALT` or a `RETURN`
//! that empties the frame chain (terminate), an error (crash), `RECEIVE`
//! on an empty mailbox (park), or the reduction budget (yield). Calls and
//! backward branches each cost one reduction and double as the kill-flag
//! and GC safepoints. There is no other preemption.

use std::sync::atomic::{AtomicBool, Ordering};

use bloc_core::cache::InlineCache;
use bloc_core::chunk::{Bytecode, Chunk, Op, load_constant};
use bloc_core::containers::{self, OpError};
use bloc_core::heap;
use bloc_core::strings::BlocString;
use bloc_core::value::{ObjPayload, Value, release, retain, value_cmp, value_eq};

use crate::block::Limits;
use crate::mailbox::Mailbox;

/// Direct-mapped inline-cache sites per VM, indexed by opcode offset
const CACHE_SITES: usize = 64;

/// Error taxonomy surfaced to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    Type,
    Arity,
    DivideByZero,
    Overflow,
    Stack,
    Runtime,
}

impl VmErrorKind {
    fn text(self) -> &'static str {
        match self {
            VmErrorKind::Type => "type error",
            VmErrorKind::Arity => "arity error",
            VmErrorKind::DivideByZero => "division by zero",
            VmErrorKind::Overflow => "overflow",
            VmErrorKind::Stack => "stack overflow",
            VmErrorKind::Runtime => "runtime error",
        }
    }
}

/// A crash-worthy failure, pinned to the opcode and source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub op: &'static str,
    pub line: i32,
}

impl VmError {
    /// The crash reason recorded on the block
    pub fn reason(&self) -> String {
        format!("{} at op {} line {}", self.kind.text(), self.op, self.line)
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason())
    }
}

impl std::error::Error for VmError {}

/// Outcome of one reduction-bounded slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// Normal termination (`HALT`, or `RETURN` emptying the frame chain)
    Halted,
    /// Reduction budget exhausted; re-queue and resume later
    Yielded,
    /// `RECEIVE` on an empty mailbox; park until a message or timer
    Waiting,
    /// The kill flag was observed at a safepoint
    Killed,
    /// Crash with a reason; the worker runs exit propagation
    Error(VmError),
}

struct Frame {
    /// `None` is the main chunk
    fn_index: Option<u32>,
    ip: usize,
    /// Operand-stack index of slot 0 (the callee)
    base: usize,
}

/// One block's stack machine
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    pub reductions: u32,
    pub reduction_limit: u32,
    caches: Vec<InlineCache>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

// Control-flow signal inside the dispatch loop
enum Flow {
    Continue,
    Exit(RunResult),
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            reductions: 0,
            reduction_limit: u32::MAX,
            caches: vec![InlineCache::new(); CACHE_SITES],
        }
    }

    /// Top of the operand stack (tests and diagnostics)
    pub fn top(&self) -> Option<Value> {
        self.stack.last().copied()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Roots for a collection: every operand-stack slot (frame locals and
    /// callees live there too).
    pub fn roots(&self) -> &[Value] {
        &self.stack
    }

    /// Drop all execution state, releasing every owned reference. Used
    /// when a block is reset or torn down mid-program.
    pub fn clear(&mut self) {
        for v in self.stack.drain(..) {
            release(v);
        }
        self.frames.clear();
    }

    fn chunk_of<'a>(&self, bytecode: &'a Bytecode, fn_index: Option<u32>) -> Option<&'a Chunk> {
        match fn_index {
            None => Some(&bytecode.main),
            Some(i) => bytecode.function(i).map(|f| &f.chunk),
        }
    }

    /// Run one reduction-bounded slice.
    pub fn run(
        &mut self,
        bytecode: &Bytecode,
        mailbox: &Mailbox,
        kill: &AtomicBool,
        limits: &Limits,
    ) -> RunResult {
        if self.frames.is_empty() {
            self.frames.push(Frame {
                fn_index: None,
                ip: 0,
                base: 0,
            });
        }

        loop {
            let frame_fn = self.frames.last().map(|f| f.fn_index).unwrap_or(None);
            let Some(chunk) = self.chunk_of(bytecode, frame_fn) else {
                return self.error(VmErrorKind::Runtime, "CALL", 0);
            };

            let op_at = self.frames.last().map_or(0, |f| f.ip);
            if op_at >= chunk.code.len() {
                // Fell off the end of a chunk without HALT or RETURN
                return self.error(VmErrorKind::Runtime, "HALT", chunk.line_at(op_at));
            }
            let line = chunk.line_at(op_at);
            let Ok(op) = Op::try_from(chunk.code[op_at]) else {
                return self.error(VmErrorKind::Runtime, "BAD_OP", line);
            };
            self.bump_ip(1);

            match self.execute(op, op_at, line, chunk, bytecode, mailbox, kill, limits) {
                Flow::Continue => {}
                Flow::Exit(result) => return result,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &mut self,
        op: Op,
        op_at: usize,
        line: i32,
        chunk: &Chunk,
        bytecode: &Bytecode,
        mailbox: &Mailbox,
        kill: &AtomicBool,
        limits: &Limits,
    ) -> Flow {
        macro_rules! fail {
            ($kind:expr) => {
                return Flow::Exit(self.error($kind, op.name(), line))
            };
        }
        macro_rules! push {
            ($v:expr) => {{
                let v = $v;
                if self.stack.len() >= limits.max_stack_depth {
                    release(v);
                    fail!(VmErrorKind::Stack);
                }
                self.stack.push(v);
            }};
        }
        macro_rules! pop {
            () => {
                match self.stack.pop() {
                    Some(v) => v,
                    None => fail!(VmErrorKind::Runtime),
                }
            };
        }
        macro_rules! container {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(OpError::Type { .. }) => fail!(VmErrorKind::Type),
                    Err(_) => fail!(VmErrorKind::Runtime),
                }
            };
        }

        match op {
            Op::Nil => push!(Value::Nil),
            Op::True => push!(Value::Bool(true)),
            Op::False => push!(Value::Bool(false)),
            Op::Const => {
                let k = self.read_u16(chunk);
                match load_constant(chunk, k) {
                    Some(v) => push!(v),
                    None => fail!(VmErrorKind::Runtime),
                }
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                let b = pop!();
                let a = pop!();
                match arith(op, a, b) {
                    Ok(v) => push!(v),
                    Err(kind) => fail!(kind),
                }
            }
            Op::Neg => {
                let a = pop!();
                match a {
                    Value::Int(n) => push!(Value::Int(n.wrapping_neg())),
                    Value::Float(f) => push!(Value::Float(-f)),
                    _ => fail!(VmErrorKind::Type),
                }
            }

            Op::Eq | Op::Ne => {
                let b = pop!();
                let a = pop!();
                let eq = value_eq(a, b);
                release(a);
                release(b);
                push!(Value::Bool(if op == Op::Eq { eq } else { !eq }));
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let b = pop!();
                let a = pop!();
                let Some(ord) = value_cmp(a, b) else {
                    fail!(VmErrorKind::Type)
                };
                release(a);
                release(b);
                let truth = match op {
                    Op::Lt => ord.is_lt(),
                    Op::Le => ord.is_le(),
                    Op::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                };
                push!(Value::Bool(truth));
            }
            Op::Not => {
                let a = pop!();
                let Some(b) = a.as_bool() else {
                    fail!(VmErrorKind::Type)
                };
                push!(Value::Bool(!b));
            }
            Op::And | Op::Or => {
                let b = pop!();
                let a = pop!();
                let (Some(x), Some(y)) = (a.as_bool(), b.as_bool()) else {
                    fail!(VmErrorKind::Type)
                };
                push!(Value::Bool(if op == Op::And { x && y } else { x || y }));
            }

            Op::GetLocal => {
                let slot = self.read_u8(chunk) as usize;
                let base = self.frames.last().map_or(0, |f| f.base);
                let Some(&v) = self.stack.get(base + slot) else {
                    fail!(VmErrorKind::Runtime)
                };
                if !retain(v) {
                    fail!(VmErrorKind::Runtime);
                }
                push!(v);
            }
            Op::SetLocal => {
                let slot = self.read_u8(chunk) as usize;
                let base = self.frames.last().map_or(0, |f| f.base);
                let v = pop!();
                let Some(dest) = self.stack.get_mut(base + slot) else {
                    release(v);
                    fail!(VmErrorKind::Runtime)
                };
                let old = std::mem::replace(dest, v);
                release(old);
            }
            Op::Dup => {
                let Some(&v) = self.stack.last() else {
                    fail!(VmErrorKind::Runtime)
                };
                if !retain(v) {
                    fail!(VmErrorKind::Runtime);
                }
                push!(v);
            }
            Op::Pop => {
                let v = pop!();
                release(v);
            }
            Op::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    fail!(VmErrorKind::Runtime);
                }
                self.stack.swap(len - 1, len - 2);
            }

            Op::Jump => {
                let rel = self.read_u16(chunk) as usize;
                self.bump_ip(rel);
            }
            Op::JumpIf | Op::JumpUnless => {
                let rel = self.read_u16(chunk) as usize;
                let cond = pop!();
                let Some(b) = cond.as_bool() else {
                    fail!(VmErrorKind::Type)
                };
                let take = if op == Op::JumpIf { b } else { !b };
                if take {
                    self.bump_ip(rel);
                }
            }
            Op::Loop => {
                let rel = self.read_u16(chunk) as usize;
                if let Some(frame) = self.frames.last_mut() {
                    frame.ip -= rel.min(frame.ip);
                }
                if let Flow::Exit(r) = self.checkpoint(mailbox, kill) {
                    return Flow::Exit(r);
                }
            }

            Op::Call => {
                let argc = self.read_u8(chunk) as usize;
                if self.stack.len() < argc + 1 {
                    fail!(VmErrorKind::Runtime);
                }
                let callee_at = self.stack.len() - argc - 1;
                let callee = self.stack[callee_at];
                let Some(r) = callee.obj() else {
                    fail!(VmErrorKind::Type)
                };
                // Safety: the stack slot owns a live reference
                let (fn_index, arity) = match unsafe { r.as_obj().payload() } {
                    ObjPayload::Function(f) => (f.fn_index, f.arity),
                    ObjPayload::Closure(c) => (c.fn_index, c.arity),
                    _ => fail!(VmErrorKind::Type),
                };
                if arity as usize != argc {
                    fail!(VmErrorKind::Arity);
                }
                if self.frames.len() >= limits.max_call_depth {
                    fail!(VmErrorKind::Stack);
                }
                if bytecode.function(fn_index).is_none() {
                    fail!(VmErrorKind::Runtime);
                }
                self.frames.push(Frame {
                    fn_index: Some(fn_index),
                    ip: 0,
                    base: callee_at,
                });
                if let Flow::Exit(r) = self.checkpoint(mailbox, kill) {
                    return Flow::Exit(r);
                }
            }
            Op::Return => {
                let ret = pop!();
                let Some(frame) = self.frames.pop() else {
                    release(ret);
                    fail!(VmErrorKind::Runtime)
                };
                while self.stack.len() > frame.base {
                    let v = self.stack.pop().expect("length checked");
                    release(v);
                }
                if self.frames.is_empty() {
                    self.stack.push(ret);
                    return Flow::Exit(RunResult::Halted);
                }
                push!(ret);
            }
            Op::Closure => {
                let fn_index = self.read_u16(chunk);
                let upvalue_count = self.read_u8(chunk) as usize;
                let Some(f) = bytecode.function(u32::from(fn_index)) else {
                    fail!(VmErrorKind::Runtime)
                };
                let arity = f.arity;
                if self.stack.len() < upvalue_count {
                    fail!(VmErrorKind::Runtime);
                }
                let at = self.stack.len() - upvalue_count;
                let upvalues: Vec<Value> = self.stack.drain(at..).collect();
                let closure =
                    container!(containers::closure_new(u32::from(fn_index), arity, upvalues));
                push!(closure);
            }
            Op::GetUpvalue => {
                let idx = self.read_u8(chunk) as usize;
                let base = self.frames.last().map_or(0, |f| f.base);
                let Some(&callee) = self.stack.get(base) else {
                    fail!(VmErrorKind::Runtime)
                };
                let Some(r) = callee.obj() else {
                    fail!(VmErrorKind::Type)
                };
                // Safety: slot 0 owns the callee reference
                let ObjPayload::Closure(c) = (unsafe { r.as_obj().payload() }) else {
                    fail!(VmErrorKind::Type)
                };
                let Some(&v) = c.upvalues.get(idx) else {
                    fail!(VmErrorKind::Runtime)
                };
                if !retain(v) {
                    fail!(VmErrorKind::Runtime);
                }
                push!(v);
            }
            Op::Halt => return Flow::Exit(RunResult::Halted),

            Op::ArrayNew => push!(container!(containers::array_new())),
            Op::ArrayPush => {
                let item = pop!();
                let arr = pop!();
                push!(container!(containers::array_push(arr, item)));
            }
            Op::ArrayGet => {
                let index = pop!();
                let arr = pop!();
                let Value::Int(i) = index else {
                    fail!(VmErrorKind::Type)
                };
                let v = container!(containers::array_get(arr, i));
                release(arr);
                push!(v);
            }
            Op::ArraySet => {
                let item = pop!();
                let index = pop!();
                let arr = pop!();
                let Value::Int(i) = index else {
                    fail!(VmErrorKind::Type)
                };
                push!(container!(containers::array_set(arr, i, item)));
            }
            Op::MapNew => push!(container!(containers::map_new())),
            Op::MapGet => {
                let key = pop!();
                let map = pop!();
                let v = match self.cached_map_get(op_at, map, key) {
                    Ok(v) => v,
                    Err(kind) => fail!(kind),
                };
                release(key);
                release(map);
                push!(v);
            }
            Op::MapSet => {
                let item = pop!();
                let key = pop!();
                let map = pop!();
                let Some(key_str) = key.as_str() else {
                    fail!(VmErrorKind::Type)
                };
                let key_owned = BlocString::new(key_str);
                let result = container!(containers::map_set(map, &key_owned, item));
                release(key);
                push!(result);
            }
            Op::Len => {
                let v = pop!();
                let n = container!(containers::length(v));
                release(v);
                push!(Value::Int(n));
            }
            Op::Concat => {
                let b = pop!();
                let a = pop!();
                let joined = container!(containers::concat(a, b));
                release(a);
                release(b);
                push!(joined);
            }
            Op::Type => {
                let v = pop!();
                let name = container!(containers::type_of(v));
                release(v);
                push!(name);
            }

            Op::Receive => match mailbox.pop() {
                Some(msg) => push!(msg.value),
                None => {
                    // Rewind so the park re-executes RECEIVE on resume
                    if let Some(frame) = self.frames.last_mut() {
                        frame.ip = op_at;
                    }
                    return Flow::Exit(RunResult::Waiting);
                }
            },
        }
        Flow::Continue
    }

    /// Reduction charge at a call or backward branch: kill check, yield
    /// check, and the young-generation GC safepoint.
    fn checkpoint(&mut self, mailbox: &Mailbox, kill: &AtomicBool) -> Flow {
        self.reductions += 1;
        if kill.load(Ordering::Relaxed) {
            return Flow::Exit(RunResult::Killed);
        }
        if self.reductions >= self.reduction_limit {
            return Flow::Exit(RunResult::Yielded);
        }
        let needs = heap::with(|h| h.needs_gc()).unwrap_or(false);
        if needs {
            let mut roots = self.stack.clone();
            roots.extend(mailbox.snapshot_values());
            heap::with(|h| h.collect_young(&roots));
        }
        Flow::Continue
    }

    /// `MAP_GET` through the direct-mapped inline cache for this site
    fn cached_map_get(&mut self, op_at: usize, map: Value, key: Value) -> Result<Value, VmErrorKind> {
        let Some(r) = map.obj() else {
            return Err(VmErrorKind::Type);
        };
        let Some(key_str) = key.as_str() else {
            return Err(VmErrorKind::Type);
        };
        let key_owned = BlocString::new(key_str);
        // Safety: the popped map reference is still owned by this frame
        let ObjPayload::Map(table) = (unsafe { r.as_obj().payload() }) else {
            return Err(VmErrorKind::Type);
        };
        let shape = InlineCache::shape_of(r.identity(), table.bucket_count());
        let cache = &mut self.caches[op_at & (CACHE_SITES - 1)];

        let found = match cache.lookup(shape) {
            Some(bucket) => match table.get_in_bucket(bucket as usize, &key_owned) {
                Some(v) => Some(v),
                // The cached bucket belongs to a different key at this
                // site; fall back and re-learn.
                None => {
                    let v = table.get(&key_owned);
                    if let Some(b) = table.bucket_for(&key_owned) {
                        cache.update(shape, b as u32);
                    }
                    v
                }
            },
            None => {
                let v = table.get(&key_owned);
                if let Some(b) = table.bucket_for(&key_owned) {
                    cache.update(shape, b as u32);
                }
                v
            }
        };
        match found {
            Some(v) => {
                if !retain(v) {
                    return Err(VmErrorKind::Runtime);
                }
                Ok(v)
            }
            None => Ok(Value::Nil),
        }
    }

    fn error(&self, kind: VmErrorKind, op: &'static str, line: i32) -> RunResult {
        RunResult::Error(VmError { kind, op, line })
    }

    fn bump_ip(&mut self, by: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip += by;
        }
    }

    fn read_u8(&mut self, chunk: &Chunk) -> u8 {
        let at = self.frames.last().map_or(0, |f| f.ip);
        self.bump_ip(1);
        chunk.code.get(at).copied().unwrap_or(0)
    }

    fn read_u16(&mut self, chunk: &Chunk) -> u16 {
        let at = self.frames.last().map_or(0, |f| f.ip);
        self.bump_ip(2);
        chunk.read_u16_at(at)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Binary arithmetic on the numeric tower: int op int stays int
/// (wrapping), anything involving a float is float. Integer division and
/// modulo by zero are errors; float division produces inf/NaN.
fn arith(op: Op, a: Value, b: Value) -> Result<Value, VmErrorKind> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(match op {
            Op::Add => Value::Int(x.wrapping_add(y)),
            Op::Sub => Value::Int(x.wrapping_sub(y)),
            Op::Mul => Value::Int(x.wrapping_mul(y)),
            Op::Div => {
                if y == 0 {
                    return Err(VmErrorKind::DivideByZero);
                }
                Value::Int(x.wrapping_div(y))
            }
            _ => {
                if y == 0 {
                    return Err(VmErrorKind::DivideByZero);
                }
                Value::Int(x.wrapping_rem(y))
            }
        }),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let x = match a {
                Value::Int(n) => n as f64,
                Value::Float(f) => f,
                _ => unreachable!(),
            };
            let y = match b {
                Value::Int(n) => n as f64,
                Value::Float(f) => f,
                _ => unreachable!(),
            };
            Ok(Value::Float(match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div => x / y,
                _ => x % y,
            }))
        }
        _ => Err(VmErrorKind::Type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloc_core::heap::{DEFAULT_MAX_HEAP, Heap, install};
    use crate::mailbox::Message;

    /// Run a program to completion and hand the result plus the live VM to
    /// the check closure (the heap stays installed while it runs, so the
    /// closure may inspect heap-backed stack values).
    fn run_program(bytecode: &Bytecode, check: impl FnOnce(RunResult, &Vm)) {
        let mut heap = Heap::new(DEFAULT_MAX_HEAP);
        let _guard = install(&mut heap);
        let mailbox = Mailbox::new(16);
        let kill = AtomicBool::new(false);
        let limits = Limits::default();
        let mut vm = Vm::new();
        vm.reduction_limit = u32::MAX;
        let result = vm.run(bytecode, &mailbox, &kill, &limits);
        check(result, &vm);
    }

    #[test]
    fn test_arithmetic_chunk() {
        // CONST 10; CONST 20; ADD; HALT  ->  int(30), HALT
        let mut bc = Bytecode::new();
        let k10 = bc.main.add_int(10);
        let k20 = bc.main.add_int(20);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k10, 1);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k20, 1);
        bc.main.emit(Op::Add, 1);
        bc.main.emit(Op::Halt, 1);

        run_program(&bc, |result, vm| {
            assert_eq!(result, RunResult::Halted);
            assert_eq!(vm.top(), Some(Value::Int(30)));
        });
    }

    #[test]
    fn test_division_by_zero() {
        let mut bc = Bytecode::new();
        let k1 = bc.main.add_int(1);
        let k0 = bc.main.add_int(0);
        bc.main.emit(Op::Const, 3);
        bc.main.emit_u16(k1, 3);
        bc.main.emit(Op::Const, 3);
        bc.main.emit_u16(k0, 3);
        bc.main.emit(Op::Div, 3);
        bc.main.emit(Op::Halt, 3);

        run_program(&bc, |result, _vm| match result {
            RunResult::Error(e) => {
                assert_eq!(e.kind, VmErrorKind::DivideByZero);
                assert_eq!(e.reason(), "division by zero at op DIV line 3");
            }
            other => panic!("expected error, got {other:?}"),
        });
    }

    #[test]
    fn test_float_division_by_zero_is_inf() {
        let mut bc = Bytecode::new();
        let k1 = bc.main.add_float(1.0);
        let k0 = bc.main.add_float(0.0);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k1, 1);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k0, 1);
        bc.main.emit(Op::Div, 1);
        bc.main.emit(Op::Halt, 1);

        run_program(&bc, |result, vm| {
            assert_eq!(result, RunResult::Halted);
            assert_eq!(vm.top(), Some(Value::Float(f64::INFINITY)));
        });
    }

    #[test]
    fn test_comparison_and_jump() {
        // 1 < 2 ? push 100 : push 200
        let mut bc = Bytecode::new();
        let k1 = bc.main.add_int(1);
        let k2 = bc.main.add_int(2);
        let k100 = bc.main.add_int(100);
        let k200 = bc.main.add_int(200);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k1, 1);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k2, 1);
        bc.main.emit(Op::Lt, 1);
        let then_jump = bc.main.emit_jump(Op::JumpIf, 1);
        bc.main.emit(Op::Const, 2);
        bc.main.emit_u16(k200, 2);
        let done_jump = bc.main.emit_jump(Op::Jump, 2);
        bc.main.patch_jump(then_jump);
        bc.main.emit(Op::Const, 3);
        bc.main.emit_u16(k100, 3);
        bc.main.patch_jump(done_jump);
        bc.main.emit(Op::Halt, 4);

        run_program(&bc, |result, vm| {
            assert_eq!(result, RunResult::Halted);
            assert_eq!(vm.top(), Some(Value::Int(100)));
        });
    }

    #[test]
    fn test_recursive_factorial() {
        // fact(n) = if n <= 1 then 1 else n * fact(n - 1); fact(5) = 120
        let mut bc = Bytecode::new();
        let mut fact = Chunk::new();
        let k1 = fact.add_int(1);
        // n <= 1 ?
        fact.emit(Op::GetLocal, 1);
        fact.emit_u8(1, 1);
        fact.emit(Op::Const, 1);
        fact.emit_u16(k1, 1);
        fact.emit(Op::Le, 1);
        let base_case = fact.emit_jump(Op::JumpIf, 1);
        // n * fact(n - 1)
        fact.emit(Op::GetLocal, 2);
        fact.emit_u8(1, 2);
        fact.emit(Op::GetLocal, 2);
        fact.emit_u8(0, 2); // the callee itself: recursion
        fact.emit(Op::GetLocal, 2);
        fact.emit_u8(1, 2);
        fact.emit(Op::Const, 2);
        fact.emit_u16(k1, 2);
        fact.emit(Op::Sub, 2);
        fact.emit(Op::Call, 2);
        fact.emit_u8(1, 2);
        fact.emit(Op::Mul, 2);
        fact.emit(Op::Return, 2);
        // base: 1
        fact.patch_jump(base_case);
        fact.emit(Op::Const, 3);
        fact.emit_u16(k1, 3);
        fact.emit(Op::Return, 3);

        let fn_index = bc.add_function(fact, 1, Some("fact"));
        let kf = bc.main.add_function(fn_index, 1, Some("fact"));
        let k5 = bc.main.add_int(5);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(kf, 1);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k5, 1);
        bc.main.emit(Op::Call, 1);
        bc.main.emit_u8(1, 1);
        bc.main.emit(Op::Halt, 1);

        run_program(&bc, |result, vm| {
            assert_eq!(result, RunResult::Halted);
            assert_eq!(vm.top(), Some(Value::Int(120)));
        });
    }

    #[test]
    fn test_arity_mismatch() {
        let mut bc = Bytecode::new();
        let mut f = Chunk::new();
        f.emit(Op::Nil, 1);
        f.emit(Op::Return, 1);
        let fn_index = bc.add_function(f, 2, None);
        let kf = bc.main.add_function(fn_index, 2, None);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(kf, 1);
        bc.main.emit(Op::Call, 1);
        bc.main.emit_u8(0, 1); // zero args to a 2-ary function
        bc.main.emit(Op::Halt, 1);

        run_program(&bc, |result, _vm| match result {
            RunResult::Error(e) => assert_eq!(e.kind, VmErrorKind::Arity),
            other => panic!("expected arity error, got {other:?}"),
        });
    }

    #[test]
    fn test_calling_non_function_is_type_error() {
        let mut bc = Bytecode::new();
        let k = bc.main.add_int(7);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k, 1);
        bc.main.emit(Op::Call, 1);
        bc.main.emit_u8(0, 1);

        run_program(&bc, |result, _vm| match result {
            RunResult::Error(e) => assert_eq!(e.kind, VmErrorKind::Type),
            other => panic!("expected type error, got {other:?}"),
        });
    }

    #[test]
    fn test_reduction_yield_and_resume() {
        // An empty infinite loop; every iteration is one reduction
        let mut bc = Bytecode::new();
        let target = bc.main.code.len();
        bc.main.emit(Op::Nil, 1);
        bc.main.emit(Op::Pop, 1);
        bc.main.emit_loop(target, 1);

        let mut heap = Heap::new(DEFAULT_MAX_HEAP);
        let _guard = install(&mut heap);
        let mailbox = Mailbox::new(16);
        let kill = AtomicBool::new(false);
        let limits = Limits::default();
        let mut vm = Vm::new();
        vm.reduction_limit = 10;
        assert_eq!(vm.run(&bc, &mailbox, &kill, &limits), RunResult::Yielded);
        assert_eq!(vm.reductions, 10);
        // Resuming runs another bounded slice
        vm.reductions = 0;
        assert_eq!(vm.run(&bc, &mailbox, &kill, &limits), RunResult::Yielded);
    }

    #[test]
    fn test_kill_flag_observed_at_checkpoint() {
        let mut bc = Bytecode::new();
        let target = bc.main.code.len();
        bc.main.emit(Op::Nil, 1);
        bc.main.emit(Op::Pop, 1);
        bc.main.emit_loop(target, 1);

        let mut heap = Heap::new(DEFAULT_MAX_HEAP);
        let _guard = install(&mut heap);
        let mailbox = Mailbox::new(16);
        let kill = AtomicBool::new(true);
        let limits = Limits::default();
        let mut vm = Vm::new();
        assert_eq!(vm.run(&bc, &mailbox, &kill, &limits), RunResult::Killed);
    }

    #[test]
    fn test_receive_parks_then_delivers() {
        let mut bc = Bytecode::new();
        bc.main.emit(Op::Receive, 1);
        bc.main.emit(Op::Halt, 1);

        let mut heap = Heap::new(DEFAULT_MAX_HEAP);
        let _guard = install(&mut heap);
        let mailbox = Mailbox::new(16);
        let kill = AtomicBool::new(false);
        let limits = Limits::default();
        let mut vm = Vm::new();
        assert_eq!(vm.run(&bc, &mailbox, &kill, &limits), RunResult::Waiting);

        mailbox.push(Message {
            sender: 7,
            value: Value::Int(99),
        });
        assert_eq!(vm.run(&bc, &mailbox, &kill, &limits), RunResult::Halted);
        assert_eq!(vm.top(), Some(Value::Int(99)));
    }

    #[test]
    fn test_call_depth_limit() {
        // f() calls itself forever
        let mut bc = Bytecode::new();
        let mut f = Chunk::new();
        f.emit(Op::GetLocal, 1);
        f.emit_u8(0, 1);
        f.emit(Op::Call, 1);
        f.emit_u8(0, 1);
        f.emit(Op::Return, 1);
        let fn_index = bc.add_function(f, 0, None);
        let kf = bc.main.add_function(fn_index, 0, None);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(kf, 1);
        bc.main.emit(Op::Call, 1);
        bc.main.emit_u8(0, 1);
        bc.main.emit(Op::Halt, 1);

        let mut heap = Heap::new(DEFAULT_MAX_HEAP);
        let _guard = install(&mut heap);
        let mailbox = Mailbox::new(16);
        let kill = AtomicBool::new(false);
        let limits = Limits {
            max_call_depth: 32,
            ..Limits::default()
        };
        let mut vm = Vm::new();
        match vm.run(&bc, &mailbox, &kill, &limits) {
            RunResult::Error(e) => assert_eq!(e.kind, VmErrorKind::Stack),
            other => panic!("expected stack error, got {other:?}"),
        }
    }

    #[test]
    fn test_map_ops_with_inline_cache() {
        // m = {}; m["x"] = 41 + 1; push m["x"] twice (second hits cache)
        let mut bc = Bytecode::new();
        let kx = bc.main.add_str("x");
        let k42 = bc.main.add_int(42);
        bc.main.emit(Op::MapNew, 1);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(kx, 1);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k42, 1);
        bc.main.emit(Op::MapSet, 1);
        bc.main.emit(Op::Dup, 2);
        bc.main.emit(Op::Const, 2);
        bc.main.emit_u16(kx, 2);
        bc.main.emit(Op::MapGet, 2);
        bc.main.emit(Op::Swap, 2);
        bc.main.emit(Op::Const, 3);
        bc.main.emit_u16(kx, 3);
        bc.main.emit(Op::MapGet, 3);
        bc.main.emit(Op::Halt, 3);

        run_program(&bc, |result, vm| {
            assert_eq!(result, RunResult::Halted);
            assert_eq!(vm.top(), Some(Value::Int(42)));
        });
    }

    #[test]
    fn test_array_ops() {
        let mut bc = Bytecode::new();
        let k7 = bc.main.add_int(7);
        let k0 = bc.main.add_int(0);
        bc.main.emit(Op::ArrayNew, 1);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(k7, 1);
        bc.main.emit(Op::ArrayPush, 1);
        bc.main.emit(Op::Const, 2);
        bc.main.emit_u16(k0, 2);
        bc.main.emit(Op::ArrayGet, 2);
        bc.main.emit(Op::Halt, 2);

        run_program(&bc, |result, vm| {
            assert_eq!(result, RunResult::Halted);
            assert_eq!(vm.top(), Some(Value::Int(7)));
        });
    }

    #[test]
    fn test_concat_strings_via_opcodes() {
        let mut bc = Bytecode::new();
        let ka = bc.main.add_str("foo");
        let kb = bc.main.add_str("bar");
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(ka, 1);
        bc.main.emit(Op::Const, 1);
        bc.main.emit_u16(kb, 1);
        bc.main.emit(Op::Concat, 1);
        bc.main.emit(Op::Halt, 1);

        run_program(&bc, |result, vm| {
            assert_eq!(result, RunResult::Halted);
            assert_eq!(
                vm.top().and_then(|v| v.as_str().map(String::from)),
                Some("foobar".into())
            );
        });
    }
}
