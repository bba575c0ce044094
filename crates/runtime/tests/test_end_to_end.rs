//! End-to-end runtime scenarios: whole programs through the public
//! scheduler API, single-threaded and multi-worker.

use std::sync::Arc;

use bloc_core::chunk::{Bytecode, Chunk, Op};
use bloc_core::value::Value;
use bloc_runtime::block::{BlockState, PID_INVALID};
use bloc_runtime::caps::CapSet;
use bloc_runtime::deque::WorkDeque;
use bloc_runtime::scheduler::{Scheduler, SchedulerConfig};

/// CONST a; CONST b; ADD; HALT
fn arithmetic_program(a: i64, b: i64) -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    let ka = bc.main.add_int(a);
    let kb = bc.main.add_int(b);
    bc.main.emit(Op::Const, 1);
    bc.main.emit_u16(ka, 1);
    bc.main.emit(Op::Const, 1);
    bc.main.emit_u16(kb, 1);
    bc.main.emit(Op::Add, 1);
    bc.main.emit(Op::Halt, 1);
    Arc::new(bc)
}

/// fact(n) = if n <= 1 then 1 else n * fact(n - 1)
fn factorial_program(n: i64) -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    let mut fact = Chunk::new();
    let k1 = fact.add_int(1);
    fact.emit(Op::GetLocal, 1);
    fact.emit_u8(1, 1);
    fact.emit(Op::Const, 1);
    fact.emit_u16(k1, 1);
    fact.emit(Op::Le, 1);
    let base_case = fact.emit_jump(Op::JumpIf, 1);
    fact.emit(Op::GetLocal, 2);
    fact.emit_u8(1, 2);
    fact.emit(Op::GetLocal, 2);
    fact.emit_u8(0, 2);
    fact.emit(Op::GetLocal, 2);
    fact.emit_u8(1, 2);
    fact.emit(Op::Const, 2);
    fact.emit_u16(k1, 2);
    fact.emit(Op::Sub, 2);
    fact.emit(Op::Call, 2);
    fact.emit_u8(1, 2);
    fact.emit(Op::Mul, 2);
    fact.emit(Op::Return, 2);
    fact.patch_jump(base_case);
    fact.emit(Op::Const, 3);
    fact.emit_u16(k1, 3);
    fact.emit(Op::Return, 3);

    let fn_index = bc.add_function(fact, 1, Some("fact"));
    let kf = bc.main.add_function(fn_index, 1, Some("fact"));
    let kn = bc.main.add_int(n);
    bc.main.emit(Op::Const, 1);
    bc.main.emit_u16(kf, 1);
    bc.main.emit(Op::Const, 1);
    bc.main.emit_u16(kn, 1);
    bc.main.emit(Op::Call, 1);
    bc.main.emit_u8(1, 1);
    bc.main.emit(Op::Halt, 1);
    Arc::new(bc)
}

/// Loop `n` times doing busy work, then halt
fn loop_program(n: i64) -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    let kn = bc.main.add_int(n);
    let k1 = bc.main.add_int(1);
    let k0 = bc.main.add_int(0);
    bc.main.emit(Op::Const, 1);
    bc.main.emit_u16(kn, 1);
    let top = bc.main.code.len();
    bc.main.emit(Op::GetLocal, 2);
    bc.main.emit_u8(0, 2);
    bc.main.emit(Op::Const, 2);
    bc.main.emit_u16(k1, 2);
    bc.main.emit(Op::Sub, 2);
    bc.main.emit(Op::SetLocal, 2);
    bc.main.emit_u8(0, 2);
    bc.main.emit(Op::GetLocal, 3);
    bc.main.emit_u8(0, 3);
    bc.main.emit(Op::Const, 3);
    bc.main.emit_u16(k0, 3);
    bc.main.emit(Op::Gt, 3);
    let exit = bc.main.emit_jump(Op::JumpUnless, 3);
    bc.main.emit_loop(top, 3);
    bc.main.patch_jump(exit);
    bc.main.emit(Op::Halt, 4);
    Arc::new(bc)
}

/// Park on RECEIVE, then divide by zero when woken
fn crash_on_message_program() -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    let k1 = bc.main.add_int(1);
    let k0 = bc.main.add_int(0);
    bc.main.emit(Op::Receive, 1);
    bc.main.emit(Op::Pop, 1);
    bc.main.emit(Op::Const, 2);
    bc.main.emit_u16(k1, 2);
    bc.main.emit(Op::Const, 2);
    bc.main.emit_u16(k0, 2);
    bc.main.emit(Op::Div, 2);
    bc.main.emit(Op::Halt, 2);
    Arc::new(bc)
}

/// Park on RECEIVE forever (first message halts it)
fn receive_program() -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    bc.main.emit(Op::Receive, 1);
    bc.main.emit(Op::Halt, 1);
    Arc::new(bc)
}

/// Receive `n` messages into an array, then halt with the array on top
fn collect_program(n: usize) -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    bc.main.emit(Op::ArrayNew, 1);
    for _ in 0..n {
        bc.main.emit(Op::Receive, 2);
        bc.main.emit(Op::ArrayPush, 2);
    }
    bc.main.emit(Op::Halt, 3);
    Arc::new(bc)
}

#[test]
fn test_arithmetic_block() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let pid = sched.spawn(arithmetic_program(10, 20), None);
    sched.run();

    let block = sched.lookup(pid).expect("registered");
    assert_eq!(block.state(), BlockState::Dead);
    assert_eq!(block.exit_info().expect("exit info").code, 0);
    assert_eq!(block.stack_top(), Some(Value::Int(30)));
}

#[test]
fn test_recursive_factorial_block() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let pid = sched.spawn(factorial_program(5), None);
    sched.run();

    let block = sched.lookup(pid).expect("registered");
    assert_eq!(block.stack_top(), Some(Value::Int(120)));
}

#[test]
fn test_parallel_load_four_workers() {
    // 40 blocks each looping 500 times on 4 workers with stealing
    let sched = Scheduler::new(SchedulerConfig {
        num_workers: 4,
        enable_stealing: true,
        ..SchedulerConfig::default()
    });
    for _ in 0..40 {
        sched.spawn(loop_program(500), None);
    }
    sched.run();

    let stats = sched.stats();
    assert_eq!(stats.blocks_total, 40);
    assert_eq!(stats.blocks_dead, 40);
    assert_eq!(stats.blocks_alive, 0);
    assert_eq!(stats.total_spawned, 40);
    assert_eq!(stats.total_terminated, 40);
    assert!(stats.total_reductions > 0);
    assert!(stats.context_switches > 0);
    sched.shutdown();
}

#[test]
fn test_exit_propagation_crash_kills_linked_peer() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let a = sched.spawn(crash_on_message_program(), None);
    let b = sched.spawn(receive_program(), None);
    sched.run(); // both park on RECEIVE
    assert!(sched.link(a, b));

    // Wake A; it crashes, and the crash propagates over the link
    assert!(sched.send(PID_INVALID, a, Value::Nil));
    sched.run();

    let block_a = sched.lookup(a).expect("a");
    let block_b = sched.lookup(b).expect("b");
    assert_eq!(block_a.state(), BlockState::Dead);
    assert!(block_a
        .exit_info()
        .expect("exit info")
        .reason
        .expect("reason")
        .contains("division by zero"));
    assert_eq!(block_b.state(), BlockState::Dead);
    assert_eq!(sched.stats().total_terminated, 2);
}

#[test]
fn test_exit_propagation_trap_exit_receives_message() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let a = sched.spawn(crash_on_message_program(), None);
    let b = sched.spawn(receive_program(), None);
    sched.run();
    assert!(sched.link(a, b));
    sched.lookup(b).expect("b").grant(CapSet::TRAP_EXIT);

    assert!(sched.send(PID_INVALID, a, Value::Nil));

    // B wakes on the exit message and halts with it; it stayed alive
    // through A's crash and terminated normally.
    sched.run();
    let block_b = sched.lookup(b).expect("b");
    assert_eq!(block_b.exit_info().expect("exit info").code, 0);
    assert_eq!(
        block_b.counters.messages_received.load(std::sync::atomic::Ordering::Acquire),
        1
    );
}

#[test]
fn test_capability_enforcement() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let pid = sched.spawn_ex(receive_program(), None, CapSet::SPAWN, None);
    let block = sched.lookup(pid).expect("registered");

    assert!(block.check_cap(CapSet::SPAWN));
    assert!(!block.check_cap(CapSet::FILE_READ));
    assert_eq!(block.state(), BlockState::Dead);
    assert_eq!(
        block.exit_info().expect("exit info").reason.as_deref(),
        Some("capability denied: FILE_READ")
    );
}

#[test]
fn test_deque_steal_order_is_fifo() {
    // Push 10 blocks on one worker's deque; a thief steals them back in
    // insertion order
    let sched = Scheduler::new(SchedulerConfig::default());
    let deque: WorkDeque<bloc_runtime::block::Block> = WorkDeque::new();
    let mut pids = Vec::new();
    for _ in 0..10 {
        let pid = sched.spawn(receive_program(), None);
        pids.push(pid);
        deque.push(sched.lookup(pid).expect("registered"));
    }
    let stolen: Vec<u64> = (0..10)
        .map(|_| deque.steal().expect("non-empty").pid())
        .collect();
    assert_eq!(stolen, pids);
}

#[test]
fn test_message_order_per_sender() {
    // Ten sends from one sender arrive in send order
    let sched = Scheduler::new(SchedulerConfig::default());
    let pid = sched.spawn(collect_program(10), None);
    sched.run(); // parks on the first RECEIVE
    for i in 0..10 {
        assert!(sched.send(PID_INVALID, pid, Value::Int(i)));
    }
    sched.run();

    let block = sched.lookup(pid).expect("registered");
    assert_eq!(block.state(), BlockState::Dead);
    let arr = block.stack_top().expect("array on top");
    for i in 0..10 {
        let v = bloc_core::containers::array_get(arr, i).expect("in range");
        assert_eq!(v, Value::Int(i));
    }
}

#[test]
fn test_spawn_overflow_returns_invalid_pid() {
    let sched = Scheduler::new(SchedulerConfig {
        max_blocks: 3,
        ..SchedulerConfig::default()
    });
    let first = sched.spawn(receive_program(), None);
    assert_ne!(first, PID_INVALID);
    for _ in 0..2 {
        assert_ne!(sched.spawn(receive_program(), None), PID_INVALID);
    }
    assert_eq!(sched.spawn(receive_program(), None), PID_INVALID);
    // A termination frees capacity
    sched.kill(first);
    assert_ne!(sched.spawn(receive_program(), None), PID_INVALID);
}
