//! # Driver — Batch Work Loop
//!
//! Reads one work item per input line and, for each, in order:
//!
//! 1. claims the item through the [`LockManager`] (skip if busy),
//! 2. factors it with the [`FallbackController`],
//! 3. submits the factors through the [`SubmissionPipeline`] until done or
//!    the registry reports one as already known,
//! 4. releases the lock by dropping the token.
//!
//! Only environment failures (engine binary missing or unlaunchable) end the
//! batch. Everything else is logged and the loop moves to the next line.
//!
//! A stop flag (set by the signal listener) and an optional exit deadline are
//! checked before each new item; the item in progress always finishes.

use crate::engine::EngineExecutor;
use crate::fallback::FallbackController;
use crate::lock::{Acquire, LockManager};
use crate::progress::{Progress, ProgressSnapshot};
use crate::registry::Registry;
use crate::submit::{SubmissionPipeline, SubmitSummary};
use crate::{Result, WorkItem};
use serde::Serialize;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// What happened to one input item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemReport {
    /// Owned by another worker; nothing was run.
    Busy,
    Processed {
        factors: Vec<String>,
        proved_prime_cofactor: bool,
        submissions: SubmitSummary,
    },
    /// A non-fatal failure (lock I/O, engine error) left the item unprocessed.
    Failed(String),
}

/// End-of-run totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    #[serde(flatten)]
    pub counters: ProgressSnapshot,
    /// Items whose cofactor was proven prime.
    pub fully_factored: u64,
    /// Items where submission stopped on an already-known factor.
    pub stopped_early: u64,
    pub failed: u64,
    /// The run ended on a stop request or the exit deadline.
    pub interrupted: bool,
}

pub struct BatchDriver<E, R> {
    locks: LockManager,
    controller: FallbackController<E>,
    pipeline: SubmissionPipeline<R>,
    progress: Arc<Progress>,
    max_items: Option<u64>,
    stop: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl<E: EngineExecutor, R: Registry> BatchDriver<E, R> {
    pub fn new(
        locks: LockManager,
        controller: FallbackController<E>,
        pipeline: SubmissionPipeline<R>,
        progress: Arc<Progress>,
    ) -> Self {
        BatchDriver {
            locks,
            controller,
            pipeline,
            progress,
            max_items: None,
            stop: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// Stop after this many claimed items.
    pub fn with_max_items(mut self, max_items: Option<u64>) -> Self {
        self.max_items = max_items;
        self
    }

    /// Share a stop flag; once set, no further item is claimed.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Claim no new item after `deadline`.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    fn stop_reason(&self) -> Option<&'static str> {
        if self.stop.load(Ordering::Relaxed) {
            Some("stop requested")
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some("exit deadline reached")
        } else {
            None
        }
    }

    /// Process every line of `input`. Returns early on a fatal error, once
    /// `max_items` items have been claimed, or when asked to stop.
    pub fn run<B: BufRead>(&self, input: B) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for raw in input.split(b'\n') {
            if let Some(reason) = self.stop_reason() {
                info!(reason, "not claiming further items");
                summary.interrupted = true;
                break;
            }
            let line = match String::from_utf8(raw?) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "skipping input line that is not UTF-8");
                    self.progress.invalid.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let item = match WorkItem::parse(&line) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "skipping input line");
                    self.progress.invalid.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            match self.process_item(&item)? {
                ItemReport::Busy => {}
                ItemReport::Processed {
                    proved_prime_cofactor,
                    submissions,
                    ..
                } => {
                    if proved_prime_cofactor {
                        summary.fully_factored += 1;
                    }
                    if submissions.stopped_early {
                        summary.stopped_early += 1;
                    }
                }
                ItemReport::Failed(_) => summary.failed += 1,
            }

            if let Some(max) = self.max_items {
                if self.progress.claimed.load(Ordering::Relaxed) >= max {
                    info!(max_items = max, "item limit reached");
                    break;
                }
            }
        }
        summary.counters = self.progress.snapshot();
        Ok(summary)
    }

    /// Claim, factor, and submit one item. `Err` only for fatal errors.
    pub fn process_item(&self, item: &WorkItem) -> Result<ItemReport> {
        let token = match self.locks.try_acquire(item) {
            Ok(Acquire::Acquired(token)) => token,
            Ok(Acquire::Busy) => {
                self.progress.busy.fetch_add(1, Ordering::Relaxed);
                return Ok(ItemReport::Busy);
            }
            Err(e) => {
                error!(item = %item, error = %e, "could not take work item lock");
                return Ok(ItemReport::Failed(e.to_string()));
            }
        };
        self.progress.claimed.fetch_add(1, Ordering::Relaxed);
        self.progress.set_current(item.as_str());
        info!(item = %item, digits = item.digits(), lock = %token.path().display(), "claimed work item");

        let result = match self.controller.factor_all(item) {
            Ok(result) => result,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(item = %item, error = %e, "factoring failed");
                return Ok(ItemReport::Failed(e.to_string()));
            }
        };
        self.progress
            .factors_found
            .fetch_add(result.factors.len() as u64, Ordering::Relaxed);

        let submissions = self
            .pipeline
            .submit_all(item, result.factors.iter().map(String::as_str));
        self.progress
            .accepted
            .fetch_add(submissions.accepted as u64, Ordering::Relaxed);
        self.progress
            .already_known
            .fetch_add(submissions.already_known as u64, Ordering::Relaxed);
        self.progress
            .rejected
            .fetch_add(submissions.rejected as u64, Ordering::Relaxed);

        info!(
            item = %item,
            engine = %result.final_engine,
            factors = result.factors.len(),
            proved = result.proved_prime_cofactor,
            accepted = submissions.accepted,
            already_known = submissions.already_known,
            rejected = submissions.rejected,
            "work item done"
        );
        drop(token);

        Ok(ItemReport::Processed {
            factors: result.factors,
            proved_prime_cofactor: result.proved_prime_cofactor,
            submissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use crate::config::{RegistryConfig, TierConfig};
    use crate::engine::EngineRun;
    use crate::journal::{Journal, JournalKind};
    use crate::registry::TransportError;
    use crate::Error;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Returns canned factors per item and counts runs per item.
    #[derive(Default)]
    struct Canned {
        factors: HashMap<&'static str, Vec<&'static str>>,
        missing_binary: bool,
        runs: RefCell<Vec<String>>,
    }

    impl EngineExecutor for &Canned {
        fn run(&self, item: &WorkItem, tier: &TierConfig) -> Result<EngineRun> {
            self.runs.borrow_mut().push(item.to_string());
            if self.missing_binary {
                return Err(Error::EngineMissing {
                    engine: tier.engine.clone(),
                    program: "nope".into(),
                });
            }
            let factors = self.factors.get(item.as_str()).cloned().unwrap_or_default();
            Ok(EngineRun {
                engine: tier.engine.clone(),
                threads: tier.threads,
                started_at: Utc::now(),
                elapsed: Duration::ZERO,
                proved_prime_cofactor: !factors.is_empty(),
                factors: factors.into_iter().map(String::from).collect(),
                discarded: vec![],
                exit_code: Some(0),
                timed_out: false,
                raw_log: String::new(),
            })
        }
    }

    struct Known(Vec<&'static str>);

    impl Registry for Known {
        fn post_factor(&self, _item: &WorkItem, factor: &str) -> std::result::Result<String, TransportError> {
            if self.0.iter().any(|known| *known == factor) {
                Ok("already known".into())
            } else {
                Ok("submitted".into())
            }
        }
    }

    fn driver<'a>(
        dir: &TempDir,
        exec: &'a Canned,
        registry: Known,
    ) -> BatchDriver<&'a Canned, Known> {
        let tiers = vec![TierConfig {
            engine: "fake".into(),
            threads: 1,
            attempts: 1,
        }];
        let config = RegistryConfig {
            retry_delay_secs: 0,
            ..RegistryConfig::default()
        };
        let pipeline = SubmissionPipeline::new(
            registry,
            &config,
            AdmissionGate::new(dir.path().join("locks"), 2).unwrap(),
            Journal::open(dir.path().join("ok.csv"), JournalKind::Success).unwrap(),
            Journal::open(dir.path().join("failed.csv"), JournalKind::Failure).unwrap(),
        );
        BatchDriver::new(
            LockManager::new(dir.path().join("locks")).unwrap(),
            FallbackController::new(exec, tiers),
            pipeline,
            Progress::new(),
        )
    }

    fn canned(entries: &[(&'static str, Vec<&'static str>)]) -> Canned {
        Canned {
            factors: entries.iter().cloned().collect(),
            ..Canned::default()
        }
    }

    #[test]
    fn processes_valid_lines_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let exec = canned(&[("15", vec!["3"]), ("35", vec!["5"])]);
        let input = Cursor::new("15\n\n  35  \nabc\n007\n");
        let summary = driver(&dir, &exec, Known(vec![])).run(input).unwrap();
        assert_eq!(*exec.runs.borrow(), vec!["15", "35"]);
        assert_eq!(summary.counters.claimed, 2);
        assert_eq!(summary.counters.invalid, 2);
        assert_eq!(summary.counters.accepted, 2);
        assert_eq!(summary.fully_factored, 2);
    }

    #[test]
    fn busy_item_runs_no_engine() {
        let dir = tempfile::tempdir().unwrap();
        let exec = canned(&[("15", vec!["3"])]);
        let other_worker = LockManager::new(dir.path().join("locks")).unwrap();
        let _held = match other_worker
            .try_acquire(&WorkItem::parse("15").unwrap())
            .unwrap()
        {
            Acquire::Acquired(token) => token,
            Acquire::Busy => panic!("fresh lock directory"),
        };

        let summary = driver(&dir, &exec, Known(vec![]))
            .run(Cursor::new("15\n"))
            .unwrap();
        assert!(exec.runs.borrow().is_empty());
        assert_eq!(summary.counters.busy, 1);
        assert_eq!(summary.counters.claimed, 0);
    }

    #[test]
    fn already_known_stops_only_the_current_item() {
        let dir = tempfile::tempdir().unwrap();
        let exec = canned(&[("105", vec!["3", "5", "7"]), ("77", vec!["7", "11"])]);
        let summary = driver(&dir, &exec, Known(vec!["3"]))
            .run(Cursor::new("105\n77\n"))
            .unwrap();
        assert_eq!(summary.stopped_early, 1);
        assert_eq!(summary.counters.already_known, 1);
        // 5 and 7 of item 105 are never sent; both factors of 77 are.
        assert_eq!(summary.counters.accepted, 2);
    }

    #[test]
    fn missing_engine_aborts_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Canned {
            missing_binary: true,
            ..Canned::default()
        };
        let err = driver(&dir, &exec, Known(vec![]))
            .run(Cursor::new("15\n35\n"))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(exec.runs.borrow().len(), 1);
    }

    #[test]
    fn max_items_bounds_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let exec = canned(&[]);
        let summary = driver(&dir, &exec, Known(vec![]))
            .with_max_items(Some(2))
            .run(Cursor::new("15\n21\n35\n"))
            .unwrap();
        assert_eq!(summary.counters.claimed, 2);
        assert_eq!(exec.runs.borrow().len(), 2);
        assert_eq!(summary.fully_factored, 0);
    }

    #[test]
    fn lock_is_released_after_each_item() {
        let dir = tempfile::tempdir().unwrap();
        let exec = canned(&[("15", vec!["3"])]);
        driver(&dir, &exec, Known(vec![]))
            .run(Cursor::new("15\n"))
            .unwrap();
        let locks = LockManager::new(dir.path().join("locks")).unwrap();
        assert!(matches!(
            locks.try_acquire(&WorkItem::parse("15").unwrap()).unwrap(),
            Acquire::Acquired(_)
        ));
    }

    #[test]
    fn non_utf8_line_is_skipped_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let exec = canned(&[("15", vec!["3"]), ("35", vec!["5"])]);
        let input = Cursor::new(&b"15\n\xff\xfe\n35\r\n"[..]);
        let summary = driver(&dir, &exec, Known(vec![])).run(input).unwrap();
        assert_eq!(*exec.runs.borrow(), vec!["15", "35"]);
        assert_eq!(summary.counters.invalid, 1);
        assert_eq!(summary.counters.claimed, 2);
    }

    #[test]
    fn stop_flag_finishes_current_item_and_claims_no_more() {
        let dir = tempfile::tempdir().unwrap();
        let exec = canned(&[("15", vec!["3"])]);
        let stop = Arc::new(AtomicBool::new(false));

        /// Raises the stop flag while the first item is being submitted.
        struct StopOnPost(Arc<AtomicBool>);
        impl Registry for StopOnPost {
            fn post_factor(&self, _item: &WorkItem, _factor: &str) -> std::result::Result<String, TransportError> {
                self.0.store(true, Ordering::Relaxed);
                Ok("submitted".into())
            }
        }

        let tiers = vec![TierConfig {
            engine: "fake".into(),
            threads: 1,
            attempts: 1,
        }];
        let pipeline = SubmissionPipeline::new(
            StopOnPost(Arc::clone(&stop)),
            &RegistryConfig::default(),
            AdmissionGate::new(dir.path().join("locks"), 2).unwrap(),
            Journal::open(dir.path().join("ok.csv"), JournalKind::Success).unwrap(),
            Journal::open(dir.path().join("failed.csv"), JournalKind::Failure).unwrap(),
        );
        let driver = BatchDriver::new(
            LockManager::new(dir.path().join("locks")).unwrap(),
            FallbackController::new(&exec, tiers),
            pipeline,
            Progress::new(),
        )
        .with_stop(Arc::clone(&stop));

        let summary = driver.run(Cursor::new("15\n21\n35\n")).unwrap();
        assert_eq!(*exec.runs.borrow(), vec!["15"]);
        assert_eq!(summary.counters.accepted, 1);
        assert!(summary.interrupted);
    }

    #[test]
    fn expired_deadline_claims_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let exec = canned(&[("15", vec!["3"])]);
        let summary = driver(&dir, &exec, Known(vec![]))
            .with_deadline(Some(Instant::now()))
            .run(Cursor::new("15\n"))
            .unwrap();
        assert!(exec.runs.borrow().is_empty());
        assert_eq!(summary.counters.claimed, 0);
        assert!(summary.interrupted);
    }

    #[test]
    fn summary_serializes_flat() {
        let json = serde_json::to_value(BatchSummary::default()).unwrap();
        assert_eq!(json["claimed"], 0);
        assert_eq!(json["fully_factored"], 0);
        assert_eq!(json["interrupted"], false);
    }
}
