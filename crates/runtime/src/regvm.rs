//! Register VM
//!
//! Executes the same semantic programs as the stack VM, expressed as
//! 3-address operations over a per-frame file of 256 NaN-boxed registers.
//! Arithmetic on immediates never unboxes into a `Value`; a register move
//! is one machine-word copy.
//!
//! ## Instruction encoding
//!
//! One 32-bit word per instruction, three layouts:
//!
//! ```text
//! {op:8, rd:8, rs1:8, rs2:8}   three-address
//! {op:8, rd:8, imm:16}         immediate / constant index
//! {op:8, rd:8, rel:16-signed}  jumps, relative to the next instruction
//! ```
//!
//! A jump offset of 0 means "continue": the instruction pointer advances
//! before decoding, so offsets are relative to the instruction after the
//! jump. Backward jumps (negative offsets) and calls cost one reduction,
//! the same safepoints as the stack VM.
//!
//! ## Ownership
//!
//! Registers own references: writing a register releases the previous
//! occupant, `Move` retains the source. Frame teardown releases every
//! object register. Integers are 48-bit in this VM; arithmetic leaving
//! that range promotes to float.
//!
//! Closures are a stack-VM feature; the register VM calls plain function
//! values from the constant pool.

use std::sync::atomic::{AtomicBool, Ordering};

use num_enum::TryFromPrimitive;

use bloc_core::nanbox::NanBox;
use bloc_core::strings::BlocString;
use bloc_core::value::{FunctionData, Obj, ObjPayload, Value, release, retain, value_cmp, value_eq};

use crate::block::Limits;
use crate::mailbox::Mailbox;
use crate::vm::{RunResult, VmError, VmErrorKind};

/// Registers per frame
pub const REG_COUNT: usize = 256;

/// Register VM opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum RegOp {
    /// rd <- constants[imm]
    LoadConst = 0,
    /// rd <- imm (signed 16-bit)
    LoadInt,
    /// rd <- nil
    LoadNil,
    /// rd <- rs1 != 0
    LoadBool,
    /// rd <- rs1 (retains)
    Move,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// rd <- -rs1
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// rd <- !rs1
    Not,
    /// ip += rel
    Jmp,
    /// if rd { ip += rel }
    JmpIf,
    /// if !rd { ip += rel }
    JmpUnless,
    /// rd <- call regs[rs1] with args regs[rs1+1 .. rs1+1+rs2]
    Call,
    /// return regs[rs1] to the caller's destination register
    Ret,
    /// stop; result is regs[rd]
    Halt,
    /// rd <- next mailbox message payload (parks when empty)
    Receive,
}

impl RegOp {
    pub fn name(self) -> &'static str {
        match self {
            RegOp::LoadConst => "RLOAD_CONST",
            RegOp::LoadInt => "RLOAD_INT",
            RegOp::LoadNil => "RLOAD_NIL",
            RegOp::LoadBool => "RLOAD_BOOL",
            RegOp::Move => "RMOVE",
            RegOp::Add => "RADD",
            RegOp::Sub => "RSUB",
            RegOp::Mul => "RMUL",
            RegOp::Div => "RDIV",
            RegOp::Mod => "RMOD",
            RegOp::Neg => "RNEG",
            RegOp::Eq => "REQ",
            RegOp::Ne => "RNE",
            RegOp::Lt => "RLT",
            RegOp::Le => "RLE",
            RegOp::Gt => "RGT",
            RegOp::Ge => "RGE",
            RegOp::Not => "RNOT",
            RegOp::Jmp => "RJMP",
            RegOp::JmpIf => "RJMP_IF",
            RegOp::JmpUnless => "RJMP_UNLESS",
            RegOp::Call => "RCALL",
            RegOp::Ret => "RRET",
            RegOp::Halt => "RHALT",
            RegOp::Receive => "RRECEIVE",
        }
    }
}

/// Build a three-address instruction
pub fn abc(op: RegOp, rd: u8, rs1: u8, rs2: u8) -> u32 {
    (u32::from(op as u8) << 24) | (u32::from(rd) << 16) | (u32::from(rs1) << 8) | u32::from(rs2)
}

/// Build an immediate instruction
pub fn adi(op: RegOp, rd: u8, imm: i16) -> u32 {
    (u32::from(op as u8) << 24) | (u32::from(rd) << 16) | u32::from(imm as u16)
}

/// Build a jump instruction (rel is relative to the next instruction)
pub fn ajmp(op: RegOp, rd: u8, rel: i16) -> u32 {
    adi(op, rd, rel)
}

#[inline]
fn decode(word: u32) -> (u8, u8, u8, u8) {
    (
        (word >> 24) as u8,
        (word >> 16) as u8,
        (word >> 8) as u8,
        word as u8,
    )
}

#[inline]
fn decode_imm(word: u32) -> i16 {
    word as u16 as i16
}

/// A register-VM compilation unit: word code, line table, constant pool
/// (same pool encoding and the same runtime value world as the stack VM).
pub struct RegChunk {
    pub code: Vec<u32>,
    pub lines: Vec<i32>,
    constants: Vec<Value>,
}

impl Default for RegChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl RegChunk {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn emit(&mut self, word: u32, line: i32) {
        self.code.push(word);
        self.lines.push(line);
    }

    pub fn add_constant(&mut self, v: Value) -> u16 {
        self.constants.push(v);
        (self.constants.len() - 1) as u16
    }

    pub fn add_int(&mut self, n: i64) -> u16 {
        self.add_constant(Value::Int(n))
    }

    pub fn add_float(&mut self, f: f64) -> u16 {
        self.add_constant(Value::Float(f))
    }

    pub fn add_str(&mut self, s: &str) -> u16 {
        self.add_constant(Obj::standalone(ObjPayload::Str(BlocString::new(s))))
    }

    pub fn add_function(&mut self, fn_index: u32, arity: u8, name: Option<&str>) -> u16 {
        self.add_constant(Obj::standalone(ObjPayload::Function(FunctionData {
            fn_index,
            arity,
            name: name.map(str::to_string),
        })))
    }

    fn constant(&self, index: u16) -> Option<Value> {
        self.constants.get(index as usize).copied()
    }

    fn line_at(&self, ip: usize) -> i32 {
        self.lines.get(ip).copied().unwrap_or(0)
    }
}

impl Drop for RegChunk {
    fn drop(&mut self) {
        for v in self.constants.drain(..) {
            release(v);
        }
    }
}

/// A register-VM function-table entry
pub struct RegFunction {
    pub chunk: RegChunk,
    pub arity: u8,
    pub name: Option<String>,
}

/// A whole register-VM program
pub struct RegProgram {
    pub main: RegChunk,
    pub functions: Vec<RegFunction>,
}

impl Default for RegProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl RegProgram {
    pub fn new() -> Self {
        Self {
            main: RegChunk::new(),
            functions: Vec::new(),
        }
    }

    pub fn add_function(&mut self, chunk: RegChunk, arity: u8, name: Option<&str>) -> u32 {
        self.functions.push(RegFunction {
            chunk,
            arity,
            name: name.map(str::to_string),
        });
        (self.functions.len() - 1) as u32
    }

    fn chunk_of(&self, fn_index: Option<u32>) -> Option<&RegChunk> {
        match fn_index {
            None => Some(&self.main),
            Some(i) => self.functions.get(i as usize).map(|f| &f.chunk),
        }
    }
}

struct RegFrame {
    fn_index: Option<u32>,
    ip: usize,
    regs: Box<[NanBox; REG_COUNT]>,
    /// Caller register receiving the return value
    ret_reg: u8,
}

impl RegFrame {
    fn new(fn_index: Option<u32>, ret_reg: u8) -> Self {
        Self {
            fn_index,
            ip: 0,
            regs: Box::new([NanBox::nil(); REG_COUNT]),
            ret_reg,
        }
    }

    /// Overwrite a register, releasing the previous occupant. The new
    /// value's reference transfers into the register file.
    fn set(&mut self, rd: u8, v: NanBox) {
        let old = std::mem::replace(&mut self.regs[rd as usize], v);
        if old.is_obj() {
            release(old.to_value());
        }
    }

    #[inline]
    fn get(&self, r: u8) -> NanBox {
        self.regs[r as usize]
    }
}

impl Drop for RegFrame {
    fn drop(&mut self) {
        for r in self.regs.iter() {
            if r.is_obj() {
                release(r.to_value());
            }
        }
    }
}

/// The register-file machine
pub struct RegVm {
    frames: Vec<RegFrame>,
    pub reductions: u32,
    pub reduction_limit: u32,
    /// Result register contents after a `Halt` or final `Ret`
    result: NanBox,
}

impl Default for RegVm {
    fn default() -> Self {
        Self::new()
    }
}

impl RegVm {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            reductions: 0,
            reduction_limit: u32::MAX,
            result: NanBox::nil(),
        }
    }

    /// The program's result after normal termination
    pub fn result(&self) -> Value {
        self.result.to_value()
    }

    /// Release all execution state
    pub fn clear(&mut self) {
        self.frames.clear();
        if self.result.is_obj() {
            release(self.result.to_value());
        }
        self.result = NanBox::nil();
    }

    fn err(kind: VmErrorKind, op: RegOp, line: i32) -> RunResult {
        RunResult::Error(VmError {
            kind,
            op: op.name(),
            line,
        })
    }

    /// Run one reduction-bounded slice
    pub fn run(
        &mut self,
        program: &RegProgram,
        mailbox: &Mailbox,
        kill: &AtomicBool,
        limits: &Limits,
    ) -> RunResult {
        if self.frames.is_empty() {
            self.frames.push(RegFrame::new(None, 0));
        }

        loop {
            let fn_index = self.frames.last().map(|f| f.fn_index).unwrap_or(None);
            let Some(chunk) = program.chunk_of(fn_index) else {
                return Self::err(VmErrorKind::Runtime, RegOp::Call, 0);
            };
            let ip = self.frames.last().map_or(0, |f| f.ip);
            let Some(&word) = chunk.code.get(ip) else {
                return Self::err(VmErrorKind::Runtime, RegOp::Halt, chunk.line_at(ip));
            };
            let line = chunk.line_at(ip);
            let (raw_op, rd, rs1, rs2) = decode(word);
            let Ok(op) = RegOp::try_from(raw_op) else {
                return Self::err(VmErrorKind::Runtime, RegOp::Halt, line);
            };
            // Advance before decoding operands: jump offsets are relative
            // to the next instruction
            if let Some(frame) = self.frames.last_mut() {
                frame.ip += 1;
            }

            match op {
                RegOp::LoadConst => {
                    let index = decode_imm(word) as u16;
                    let Some(v) = chunk.constant(index) else {
                        return Self::err(VmErrorKind::Runtime, op, line);
                    };
                    if !retain(v) {
                        return Self::err(VmErrorKind::Runtime, op, line);
                    }
                    let Some(boxed) = NanBox::try_from_value(v) else {
                        // A pool integer beyond 48 bits: promote
                        release(v);
                        let Value::Int(n) = v else {
                            return Self::err(VmErrorKind::Runtime, op, line);
                        };
                        self.frame_set(rd, NanBox::from_float(n as f64));
                        continue;
                    };
                    self.frame_set(rd, boxed);
                }
                RegOp::LoadInt => {
                    let imm = i64::from(decode_imm(word));
                    self.frame_set(rd, NanBox::try_from_int(imm).expect("i16 fits 48 bits"));
                }
                RegOp::LoadNil => self.frame_set(rd, NanBox::nil()),
                RegOp::LoadBool => self.frame_set(rd, NanBox::from_bool(rs1 != 0)),
                RegOp::Move => {
                    let v = self.frame_get(rs1);
                    if v.is_obj() && !retain(v.to_value()) {
                        return Self::err(VmErrorKind::Runtime, op, line);
                    }
                    self.frame_set(rd, v);
                }

                RegOp::Add | RegOp::Sub | RegOp::Mul | RegOp::Div | RegOp::Mod => {
                    let a = self.frame_get(rs1);
                    let b = self.frame_get(rs2);
                    match reg_arith(op, a, b) {
                        Ok(v) => self.frame_set(rd, v),
                        Err(kind) => return Self::err(kind, op, line),
                    }
                }
                RegOp::Neg => {
                    let a = self.frame_get(rs1);
                    if a.is_int() {
                        let n = -a.as_int();
                        let boxed = NanBox::try_from_int(n)
                            .unwrap_or_else(|| NanBox::from_float(n as f64));
                        self.frame_set(rd, boxed);
                    } else if a.is_float() {
                        self.frame_set(rd, NanBox::from_float(-a.as_float()));
                    } else {
                        return Self::err(VmErrorKind::Type, op, line);
                    }
                }

                RegOp::Eq | RegOp::Ne => {
                    let eq = value_eq(self.frame_get(rs1).to_value(), self.frame_get(rs2).to_value());
                    self.frame_set(
                        rd,
                        NanBox::from_bool(if op == RegOp::Eq { eq } else { !eq }),
                    );
                }
                RegOp::Lt | RegOp::Le | RegOp::Gt | RegOp::Ge => {
                    let Some(ord) =
                        value_cmp(self.frame_get(rs1).to_value(), self.frame_get(rs2).to_value())
                    else {
                        return Self::err(VmErrorKind::Type, op, line);
                    };
                    let truth = match op {
                        RegOp::Lt => ord.is_lt(),
                        RegOp::Le => ord.is_le(),
                        RegOp::Gt => ord.is_gt(),
                        _ => ord.is_ge(),
                    };
                    self.frame_set(rd, NanBox::from_bool(truth));
                }
                RegOp::Not => {
                    let a = self.frame_get(rs1);
                    if !a.is_bool() {
                        return Self::err(VmErrorKind::Type, op, line);
                    }
                    self.frame_set(rd, NanBox::from_bool(!a.as_bool()));
                }

                RegOp::Jmp | RegOp::JmpIf | RegOp::JmpUnless => {
                    let rel = decode_imm(word);
                    let take = match op {
                        RegOp::Jmp => true,
                        _ => {
                            let cond = self.frame_get(rd);
                            if !cond.is_bool() {
                                return Self::err(VmErrorKind::Type, op, line);
                            }
                            let b = cond.as_bool();
                            if op == RegOp::JmpIf { b } else { !b }
                        }
                    };
                    if take {
                        if let Some(frame) = self.frames.last_mut() {
                            frame.ip = (frame.ip as i64 + i64::from(rel)) as usize;
                        }
                        if rel < 0 {
                            // Backward branch: reduction checkpoint
                            match self.checkpoint(kill) {
                                Some(exit) => return exit,
                                None => {}
                            }
                        }
                    }
                }

                RegOp::Call => {
                    let callee = self.frame_get(rs1);
                    if !callee.is_obj() {
                        return Self::err(VmErrorKind::Type, op, line);
                    }
                    let callee_ref = callee.as_obj();
                    // Safety: the register owns a live reference
                    let (fn_index, arity) =
                        match unsafe { callee_ref.as_obj().payload() } {
                            ObjPayload::Function(f) => (f.fn_index, f.arity),
                            _ => return Self::err(VmErrorKind::Type, op, line),
                        };
                    if arity != rs2 {
                        return Self::err(VmErrorKind::Arity, op, line);
                    }
                    if self.frames.len() >= limits.max_call_depth {
                        return Self::err(VmErrorKind::Stack, op, line);
                    }
                    if program.functions.get(fn_index as usize).is_none() {
                        return Self::err(VmErrorKind::Runtime, op, line);
                    }
                    let mut frame = RegFrame::new(Some(fn_index), rd);
                    // Arguments live in rs1+1 .. rs1+1+argc, copied (and
                    // retained) into the callee's low registers
                    for i in 0..rs2 {
                        let src = ((rs1 as usize + 1 + i as usize) % REG_COUNT) as u8;
                        let arg = self.frame_get(src);
                        if arg.is_obj() && !retain(arg.to_value()) {
                            return Self::err(VmErrorKind::Runtime, op, line);
                        }
                        frame.set(i, arg);
                    }
                    self.frames.push(frame);
                    match self.checkpoint(kill) {
                        Some(exit) => return exit,
                        None => {}
                    }
                }
                RegOp::Ret => {
                    let result = self.frame_get(rs1);
                    // The returning frame's drop would release this; keep
                    // it alive across the teardown
                    if result.is_obj() && !retain(result.to_value()) {
                        return Self::err(VmErrorKind::Runtime, op, line);
                    }
                    let finished = self.frames.pop().expect("running frame");
                    let ret_reg = finished.ret_reg;
                    drop(finished);
                    match self.frames.last_mut() {
                        Some(caller) => caller.set(ret_reg, result),
                        None => {
                            self.set_result(result);
                            return RunResult::Halted;
                        }
                    }
                }
                RegOp::Halt => {
                    let result = self.frame_get(rd);
                    if result.is_obj() && !retain(result.to_value()) {
                        return Self::err(VmErrorKind::Runtime, op, line);
                    }
                    self.set_result(result);
                    return RunResult::Halted;
                }

                RegOp::Receive => match mailbox.pop() {
                    Some(msg) => {
                        // Ints beyond 48 bits promote to float at this
                        // boundary
                        let boxed = NanBox::try_from_value(msg.value).unwrap_or_else(|| {
                            let promoted = match msg.value {
                                Value::Int(n) => NanBox::from_float(n as f64),
                                _ => NanBox::nil(),
                            };
                            release(msg.value);
                            promoted
                        });
                        self.frame_set(rd, boxed);
                    }
                    None => {
                        if let Some(frame) = self.frames.last_mut() {
                            frame.ip = ip;
                        }
                        return RunResult::Waiting;
                    }
                },
            }
        }
    }

    fn checkpoint(&mut self, kill: &AtomicBool) -> Option<RunResult> {
        self.reductions += 1;
        if kill.load(Ordering::Relaxed) {
            return Some(RunResult::Killed);
        }
        if self.reductions >= self.reduction_limit {
            return Some(RunResult::Yielded);
        }
        None
    }

    fn frame_get(&self, r: u8) -> NanBox {
        self.frames.last().expect("running frame").get(r)
    }

    fn frame_set(&mut self, rd: u8, v: NanBox) {
        self.frames.last_mut().expect("running frame").set(rd, v);
    }

    fn set_result(&mut self, v: NanBox) {
        if self.result.is_obj() {
            release(self.result.to_value());
        }
        self.result = v;
    }
}

impl Drop for RegVm {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Arithmetic over NaN-boxed operands. Int results outside the 48-bit
/// payload range promote to float.
fn reg_arith(op: RegOp, a: NanBox, b: NanBox) -> Result<NanBox, VmErrorKind> {
    if a.is_int() && b.is_int() {
        let (x, y) = (a.as_int(), b.as_int());
        let wide = match op {
            RegOp::Add => x.checked_add(y),
            RegOp::Sub => x.checked_sub(y),
            RegOp::Mul => x.checked_mul(y),
            RegOp::Div => {
                if y == 0 {
                    return Err(VmErrorKind::DivideByZero);
                }
                x.checked_div(y)
            }
            _ => {
                if y == 0 {
                    return Err(VmErrorKind::DivideByZero);
                }
                x.checked_rem(y)
            }
        };
        return Ok(match wide.and_then(NanBox::try_from_int) {
            Some(boxed) => boxed,
            None => {
                let (xf, yf) = (x as f64, y as f64);
                NanBox::from_float(match op {
                    RegOp::Add => xf + yf,
                    RegOp::Sub => xf - yf,
                    RegOp::Mul => xf * yf,
                    RegOp::Div => xf / yf,
                    _ => xf % yf,
                })
            }
        });
    }
    let to_f = |v: NanBox| -> Option<f64> {
        if v.is_float() {
            Some(v.as_float())
        } else if v.is_int() {
            Some(v.as_int() as f64)
        } else {
            None
        }
    };
    let (Some(x), Some(y)) = (to_f(a), to_f(b)) else {
        return Err(VmErrorKind::Type);
    };
    Ok(NanBox::from_float(match op {
        RegOp::Add => x + y,
        RegOp::Sub => x - y,
        RegOp::Mul => x * y,
        RegOp::Div => x / y,
        _ => x % y,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloc_core::nanbox::MAX_BOX_INT;

    fn run_to_end(program: &RegProgram) -> (RunResult, Value) {
        let mailbox = Mailbox::new(16);
        let kill = AtomicBool::new(false);
        let limits = Limits::default();
        let mut vm = RegVm::new();
        let result = vm.run(program, &mailbox, &kill, &limits);
        (result, vm.result())
    }

    #[test]
    fn test_add_constants() {
        let mut p = RegProgram::new();
        let k10 = p.main.add_int(10);
        let k20 = p.main.add_int(20);
        p.main.emit(adi(RegOp::LoadConst, 0, k10 as i16), 1);
        p.main.emit(adi(RegOp::LoadConst, 1, k20 as i16), 1);
        p.main.emit(abc(RegOp::Add, 2, 0, 1), 1);
        p.main.emit(abc(RegOp::Halt, 2, 0, 0), 1);
        let (result, value) = run_to_end(&p);
        assert_eq!(result, RunResult::Halted);
        assert_eq!(value, Value::Int(30));
    }

    #[test]
    fn test_float_arithmetic_stays_boxed() {
        let mut p = RegProgram::new();
        let ka = p.main.add_float(1.5);
        let kb = p.main.add_float(2.25);
        p.main.emit(adi(RegOp::LoadConst, 0, ka as i16), 1);
        p.main.emit(adi(RegOp::LoadConst, 1, kb as i16), 1);
        p.main.emit(abc(RegOp::Mul, 2, 0, 1), 1);
        p.main.emit(abc(RegOp::Halt, 2, 0, 0), 1);
        let (_, value) = run_to_end(&p);
        assert_eq!(value, Value::Float(3.375));
    }

    #[test]
    fn test_int_overflow_promotes_to_float() {
        let mut p = RegProgram::new();
        let kmax = p.main.add_int(MAX_BOX_INT);
        p.main.emit(adi(RegOp::LoadConst, 0, kmax as i16), 1);
        p.main.emit(adi(RegOp::LoadInt, 1, 1), 1);
        p.main.emit(abc(RegOp::Add, 2, 0, 1), 1);
        p.main.emit(abc(RegOp::Halt, 2, 0, 0), 1);
        let (_, value) = run_to_end(&p);
        assert_eq!(value, Value::Float((MAX_BOX_INT + 1) as f64));
    }

    #[test]
    fn test_division_by_zero() {
        let mut p = RegProgram::new();
        p.main.emit(adi(RegOp::LoadInt, 0, 1), 3);
        p.main.emit(adi(RegOp::LoadInt, 1, 0), 3);
        p.main.emit(abc(RegOp::Div, 2, 0, 1), 3);
        p.main.emit(abc(RegOp::Halt, 2, 0, 0), 3);
        let (result, _) = run_to_end(&p);
        match result {
            RunResult::Error(e) => {
                assert_eq!(e.kind, VmErrorKind::DivideByZero);
                assert_eq!(e.line, 3);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_loop_counts_down() {
        // r0 = 5; while r0 > 0 { r0 = r0 - 1 }; halt r0
        let mut p = RegProgram::new();
        p.main.emit(adi(RegOp::LoadInt, 0, 5), 1);
        p.main.emit(adi(RegOp::LoadInt, 1, 1), 1);
        p.main.emit(adi(RegOp::LoadInt, 2, 0), 1);
        // top: r3 = r0 > r2
        p.main.emit(abc(RegOp::Gt, 3, 0, 2), 2);
        p.main.emit(ajmp(RegOp::JmpUnless, 3, 2), 2);
        p.main.emit(abc(RegOp::Sub, 0, 0, 1), 2);
        p.main.emit(ajmp(RegOp::Jmp, 0, -4), 2);
        p.main.emit(abc(RegOp::Halt, 0, 0, 0), 3);
        let (result, value) = run_to_end(&p);
        assert_eq!(result, RunResult::Halted);
        assert_eq!(value, Value::Int(0));
    }

    #[test]
    fn test_call_and_return() {
        // double(x) = x + x; main: r0 = double(21)
        let mut p = RegProgram::new();
        let mut double = RegChunk::new();
        double.emit(abc(RegOp::Add, 1, 0, 0), 1);
        double.emit(abc(RegOp::Ret, 0, 1, 0), 1);
        let fn_index = p.add_function(double, 1, Some("double"));

        let kf = p.main.add_function(fn_index, 1, Some("double"));
        p.main.emit(adi(RegOp::LoadConst, 1, kf as i16), 2);
        p.main.emit(adi(RegOp::LoadInt, 2, 21), 2);
        p.main.emit(abc(RegOp::Call, 0, 1, 1), 2);
        p.main.emit(abc(RegOp::Halt, 0, 0, 0), 2);
        let (result, value) = run_to_end(&p);
        assert_eq!(result, RunResult::Halted);
        assert_eq!(value, Value::Int(42));
    }

    #[test]
    fn test_arity_mismatch() {
        let mut p = RegProgram::new();
        let mut f = RegChunk::new();
        f.emit(abc(RegOp::Ret, 0, 0, 0), 1);
        let fn_index = p.add_function(f, 2, None);
        let kf = p.main.add_function(fn_index, 2, None);
        p.main.emit(adi(RegOp::LoadConst, 1, kf as i16), 1);
        p.main.emit(abc(RegOp::Call, 0, 1, 0), 1);
        let (result, _) = run_to_end(&p);
        match result {
            RunResult::Error(e) => assert_eq!(e.kind, VmErrorKind::Arity),
            other => panic!("expected arity error, got {other:?}"),
        }
    }

    #[test]
    fn test_reduction_yield() {
        // Infinite backward jump
        let mut p = RegProgram::new();
        p.main.emit(adi(RegOp::LoadInt, 0, 0), 1);
        p.main.emit(ajmp(RegOp::Jmp, 0, -1), 1);

        let mailbox = Mailbox::new(16);
        let kill = AtomicBool::new(false);
        let limits = Limits::default();
        let mut vm = RegVm::new();
        vm.reduction_limit = 25;
        assert_eq!(vm.run(&p, &mailbox, &kill, &limits), RunResult::Yielded);
        assert_eq!(vm.reductions, 25);
    }

    #[test]
    fn test_receive_parks_and_resumes() {
        let mut p = RegProgram::new();
        p.main.emit(abc(RegOp::Receive, 0, 0, 0), 1);
        p.main.emit(abc(RegOp::Halt, 0, 0, 0), 1);

        let mailbox = Mailbox::new(16);
        let kill = AtomicBool::new(false);
        let limits = Limits::default();
        let mut vm = RegVm::new();
        assert_eq!(vm.run(&p, &mailbox, &kill, &limits), RunResult::Waiting);
        mailbox.push(crate::mailbox::Message {
            sender: 1,
            value: Value::Int(7),
        });
        assert_eq!(vm.run(&p, &mailbox, &kill, &limits), RunResult::Halted);
        assert_eq!(vm.result(), Value::Int(7));
    }

    #[test]
    fn test_string_registers_retain_and_compare() {
        let mut p = RegProgram::new();
        let ka = p.main.add_str("abc");
        let kb = p.main.add_str("abc");
        p.main.emit(adi(RegOp::LoadConst, 0, ka as i16), 1);
        p.main.emit(adi(RegOp::LoadConst, 1, kb as i16), 1);
        p.main.emit(abc(RegOp::Eq, 2, 0, 1), 1);
        p.main.emit(abc(RegOp::Halt, 2, 0, 0), 1);
        let (result, value) = run_to_end(&p);
        assert_eq!(result, RunResult::Halted);
        assert_eq!(value, Value::Bool(true));
    }

    #[test]
    fn test_jump_offset_zero_continues() {
        let mut p = RegProgram::new();
        p.main.emit(adi(RegOp::LoadInt, 0, 9), 1);
        p.main.emit(ajmp(RegOp::Jmp, 0, 0), 1);
        p.main.emit(abc(RegOp::Halt, 0, 0, 0), 1);
        let (result, value) = run_to_end(&p);
        assert_eq!(result, RunResult::Halted);
        assert_eq!(value, Value::Int(9));
    }
}
