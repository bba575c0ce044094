//! Runtime diagnostics
//!
//! A SIGQUIT (kill -3) dump of the live scheduler, for production
//! debugging: the block table (pid, name, state, reductions, mailbox
//! depth) plus the totals. The handler thread only renders from atomic
//! counters and try-locked registries, so a wedged scheduler still dumps.
//!
//! The signal handler needs the `diagnostics` feature (enabled by
//! default) and Unix; `dump` itself is always available, and tests and
//! hosts may call it directly.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::scheduler::Scheduler;

/// Render the diagnostic dump for a scheduler
pub fn dump(sched: &Scheduler) -> String {
    let stats = sched.stats();
    let mut out = String::new();
    let _ = writeln!(out, "=== bloc diagnostics ===");
    let _ = writeln!(out, "uptime: {} ms", sched.elapsed_ms());
    let _ = writeln!(
        out,
        "blocks: {} spawned, {} terminated, {} in flight (peak {})",
        stats.total_spawned, stats.total_terminated, stats.blocks_in_flight, stats.peak_blocks
    );
    let _ = writeln!(
        out,
        "work: {} context switches, {} reductions",
        stats.context_switches, stats.total_reductions
    );

    let mut blocks = sched.blocks_snapshot();
    blocks.sort_by_key(|b| b.pid());
    let _ = writeln!(out, "--- blocks ({}) ---", blocks.len());
    for block in blocks {
        let _ = writeln!(
            out,
            "  #{:<6} {:<10} {:<8} reductions={} mailbox={} caps={}",
            block.pid(),
            block.name().unwrap_or("-"),
            block.state().name(),
            block.counters.reductions.load(Ordering::Relaxed),
            block.mailbox.len(),
            block.caps().name(),
        );
    }
    out
}

/// Install a SIGQUIT handler that dumps `sched` to stderr. The handler
/// holds only a weak reference; a dropped scheduler turns the signal into
/// a note instead of a dump.
#[cfg(all(unix, feature = "diagnostics"))]
pub fn install_signal_handler(sched: &Arc<Scheduler>) {
    use signal_hook::consts::SIGQUIT;
    use signal_hook::iterator::Signals;
    use std::sync::Weak;

    let weak: Weak<Scheduler> = Arc::downgrade(sched);
    let mut signals = match Signals::new([SIGQUIT]) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Warning: could not install SIGQUIT handler: {e}");
            return;
        }
    };
    if let Err(e) = std::thread::Builder::new()
        .name("bloc-diagnostics".to_string())
        .spawn(move || {
            for _ in signals.forever() {
                match weak.upgrade() {
                    Some(sched) => eprint!("{}", dump(&sched)),
                    None => eprintln!("bloc diagnostics: scheduler already shut down"),
                }
            }
        })
    {
        eprintln!("Warning: could not spawn diagnostics thread: {e}");
    }
}

/// No-op on platforms or builds without signal support
#[cfg(not(all(unix, feature = "diagnostics")))]
pub fn install_signal_handler(_sched: &Arc<Scheduler>) {}
