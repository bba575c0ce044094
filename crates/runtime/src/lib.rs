//! Bloc Runtime: scheduling and execution for the Bloc language
//!
//! A multi-worker scheduler runs many isolated lightweight processes
//! ("blocks") cooperatively. Each block executes bytecode on its own
//! stack-based virtual machine, owns a private generational heap, and
//! communicates only by message passing. Preemption is reduction-based
//! and cooperative: blocks yield at calls and backward branches, never
//! mid-instruction.
//!
//! Key design principles:
//! - One block, one heap, one mailbox; no shared mutable state between
//!   blocks apart from copy-on-write message payloads
//! - Work-stealing dispatch: owner-LIFO deques keep hot blocks local,
//!   thief-FIFO steals spread cold work
//! - Failure is isolated and propagated: a crash kills the block, links
//!   spread the exit, trap-exit converts it to a message, monitors
//!   observe it
//!
//! # Modules
//!
//! - `caps`: capability bitset gating effect classes
//! - `mailbox`: bounded FIFO of messages between blocks
//! - `block`: lifecycle state machine, limits, counters, links/monitors
//! - `vm`: stack VM (frame chain, operand stack, reduction accounting)
//! - `regvm`: register VM on NaN-boxed register files
//! - `deque`: Chase-Lev work-stealing deque
//! - `timer`: hashed timer wheel
//! - `worker`: worker loop (run, steal, park)
//! - `scheduler`: PID registry, spawn/kill, exit propagation, drivers
//! - `report`: BLOC_REPORT at-exit KPI dump
//! - `diagnostics`: SIGQUIT state dump

pub mod block;
pub mod caps;
pub mod deque;
pub mod diagnostics;
pub mod mailbox;
pub mod regvm;
pub mod report;
pub mod scheduler;
pub mod timer;
pub mod vm;
pub mod worker;

// Re-export key types and functions
pub use block::{Block, BlockState, Counters, ExitInfo, Limits, PID_INVALID, SendOutcome};
pub use caps::CapSet;
pub use deque::WorkDeque;
pub use mailbox::{Mailbox, MailboxStats, Message};
pub use regvm::{RegChunk, RegOp, RegProgram, RegVm};
pub use report::{ReportConfig, emit_report};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use timer::{TimerEntry, TimerWheel};
pub use vm::{RunResult, Vm, VmError, VmErrorKind};
pub use worker::WorkerStats;
