//! At-exit report for Bloc programs
//!
//! Dumps KPIs when the host asks for them, controlled by `BLOC_REPORT`:
//! - Unset or `0` → no report, zero cost
//! - `1` → human-readable to stderr
//! - `json` → JSON to stderr
//! - `json:/path` → JSON to file
//!
//! JSON output needs the `report-json` feature (enabled by default);
//! without it, JSON requests fall back to the human format with a
//! warning.

use std::io::Write;
use std::sync::OnceLock;
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::scheduler::Scheduler;

// =============================================================================
// Report configuration (parsed from BLOC_REPORT)
// =============================================================================

/// Output format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFormat {
    Human,
    Json,
}

/// Output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDestination {
    Stderr,
    File(String),
}

/// Parsed report configuration
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub format: ReportFormat,
    pub destination: ReportDestination,
}

impl ReportConfig {
    /// Parse from the `BLOC_REPORT` environment variable
    pub fn from_env() -> Option<Self> {
        Self::parse(std::env::var("BLOC_REPORT").ok()?.as_str())
    }

    fn parse(val: &str) -> Option<Self> {
        match val {
            "" | "0" => None,
            "1" => Some(ReportConfig {
                format: ReportFormat::Human,
                destination: ReportDestination::Stderr,
            }),
            "json" => Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::Stderr,
            }),
            s if s.starts_with("json:") => Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::File(s[5..].to_string()),
            }),
            _ => {
                eprintln!("Warning: BLOC_REPORT='{val}' not recognized, ignoring");
                None
            }
        }
    }
}

static REPORT_CONFIG: OnceLock<Option<ReportConfig>> = OnceLock::new();

fn report_config() -> &'static Option<ReportConfig> {
    REPORT_CONFIG.get_or_init(ReportConfig::from_env)
}

// =============================================================================
// Report data
// =============================================================================

/// Per-worker execution counters
#[derive(Debug, Serialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub blocks_executed: u64,
    pub reductions: u64,
    pub steals_attempted: u64,
    pub steals_successful: u64,
}

/// Collected metrics for the report
#[derive(Debug, Serialize)]
pub struct ReportData {
    pub wall_clock_ms: u64,
    pub total_spawned: u64,
    pub total_terminated: u64,
    pub peak_blocks: u64,
    pub context_switches: u64,
    pub total_reductions: u64,
    pub blocks_alive: usize,
    pub blocks_dead: usize,
    pub workers: Vec<WorkerReport>,
}

/// Collect all metrics from a scheduler
pub fn collect_report_data(sched: &Scheduler) -> ReportData {
    let stats = sched.stats();
    let workers = sched
        .worker_stats
        .iter()
        .zip(sched.deques.iter())
        .enumerate()
        .map(|(worker, (ws, deque))| WorkerReport {
            worker,
            blocks_executed: ws.blocks_executed.load(Ordering::Relaxed),
            reductions: ws.reductions.load(Ordering::Relaxed),
            steals_attempted: deque.steals_attempted.load(Ordering::Relaxed),
            steals_successful: deque.steals_successful.load(Ordering::Relaxed),
        })
        .collect();
    ReportData {
        wall_clock_ms: sched.elapsed_ms(),
        total_spawned: stats.total_spawned,
        total_terminated: stats.total_terminated,
        peak_blocks: stats.peak_blocks,
        context_switches: stats.context_switches,
        total_reductions: stats.total_reductions,
        blocks_alive: stats.blocks_alive,
        blocks_dead: stats.blocks_dead,
        workers,
    }
}

fn render_human(data: &ReportData) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let _ = writeln!(out, "=== bloc report ===");
    let _ = writeln!(out, "wall clock        {} ms", data.wall_clock_ms);
    let _ = writeln!(out, "blocks spawned    {}", data.total_spawned);
    let _ = writeln!(out, "blocks terminated {}", data.total_terminated);
    let _ = writeln!(out, "peak live blocks  {}", data.peak_blocks);
    let _ = writeln!(out, "context switches  {}", data.context_switches);
    let _ = writeln!(out, "total reductions  {}", data.total_reductions);
    let _ = writeln!(
        out,
        "registry          {} alive / {} dead",
        data.blocks_alive, data.blocks_dead
    );
    for w in &data.workers {
        let _ = writeln!(
            out,
            "worker {}          {} blocks, {} reductions, steals {}/{}",
            w.worker, w.blocks_executed, w.reductions, w.steals_successful, w.steals_attempted
        );
    }
    out
}

#[cfg(feature = "report-json")]
fn render_json(data: &ReportData) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

#[cfg(not(feature = "report-json"))]
fn render_json(data: &ReportData) -> String {
    eprintln!("Warning: BLOC_REPORT=json requires the report-json feature; using human format");
    render_human(data)
}

fn render(config: &ReportConfig, data: &ReportData) -> String {
    match config.format {
        ReportFormat::Human => render_human(data),
        ReportFormat::Json => render_json(data),
    }
}

fn write_out(config: &ReportConfig, text: &str) {
    match &config.destination {
        ReportDestination::Stderr => eprint!("{text}"),
        ReportDestination::File(path) => match std::fs::File::create(path) {
            Ok(mut f) => {
                if let Err(e) = f.write_all(text.as_bytes()) {
                    eprintln!("Warning: could not write report to {path}: {e}");
                }
            }
            Err(e) => eprintln!("Warning: could not create report file {path}: {e}"),
        },
    }
}

/// Emit the report if `BLOC_REPORT` asks for one. Call after `run`
/// completes (or from an at-exit path in the host).
pub fn emit_report(sched: &Scheduler) {
    if let Some(config) = report_config() {
        emit_report_with(sched, config);
    }
}

/// Emit with an explicit configuration (bypasses the env cache; used by
/// hosts that configure reporting programmatically, and by tests).
pub fn emit_report_with(sched: &Scheduler, config: &ReportConfig) {
    let data = collect_report_data(sched);
    write_out(config, &render(config, &data));
}
