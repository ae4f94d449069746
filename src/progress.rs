//! # Progress — Atomic Batch Counters
//!
//! Counters shared between the batch driver and the background status
//! reporter. Atomics for the counters, a Mutex only for the current-item
//! string (updated once per item).
//!
//! ## Background Reporter
//!
//! A dedicated thread logs a status line every 30 seconds: items claimed and
//! skipped, factors found, and the submission outcome tally. It exits
//! within a second of `stop()`.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

pub struct Progress {
    /// Items whose lock this worker acquired.
    pub claimed: AtomicU64,
    /// Items owned by another worker.
    pub busy: AtomicU64,
    /// Input lines that were not valid work items.
    pub invalid: AtomicU64,
    pub factors_found: AtomicU64,
    pub accepted: AtomicU64,
    pub already_known: AtomicU64,
    pub rejected: AtomicU64,
    pub current: Mutex<String>,
    start: Instant,
    shutdown: AtomicBool,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub claimed: u64,
    pub busy: u64,
    pub invalid: u64,
    pub factors_found: u64,
    pub accepted: u64,
    pub already_known: u64,
    pub rejected: u64,
    pub elapsed_secs: u64,
}

impl Progress {
    pub fn new() -> Arc<Self> {
        Arc::new(Progress {
            claimed: AtomicU64::new(0),
            busy: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            factors_found: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            already_known: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            current: Mutex::new(String::new()),
            start: Instant::now(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn start_reporter(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let progress = Arc::clone(self);
        thread::spawn(move || {
            let mut last = Instant::now();
            while !progress.shutdown.load(Ordering::Relaxed) {
                thread::sleep(SHUTDOWN_POLL);
                if last.elapsed() >= REPORT_INTERVAL {
                    progress.print_status();
                    last = Instant::now();
                }
            }
        })
    }

    pub fn set_current(&self, item: &str) {
        if let Ok(mut current) = self.current.lock() {
            current.clear();
            current.push_str(item);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            factors_found: self.factors_found.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            already_known: self.already_known.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            elapsed_secs: self.start.elapsed().as_secs(),
        }
    }

    pub fn print_status(&self) {
        let snap = self.snapshot();
        let current = self
            .current
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        let h = snap.elapsed_secs / 3600;
        let m = (snap.elapsed_secs % 3600) / 60;
        let s = snap.elapsed_secs % 60;
        info!(
            current = %current,
            claimed = snap.claimed,
            busy = snap.busy,
            factors = snap.factors_found,
            accepted = snap.accepted,
            already_known = snap.already_known,
            rejected = snap.rejected,
            elapsed = format_args!("{:02}:{:02}:{:02}", h, m, s),
            "batch progress"
        );
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
