//! # Submit — Submission Pipeline
//!
//! Reports factors to the registry one at a time, in discovery order:
//!
//! 1. Guard: trivial or malformed factors are rejected locally.
//! 2. Retry loop: each call takes an admission slot, posts, classifies the
//!    reply, and releases the slot before any retry delay.
//! 3. Journal: exactly one terminal record per decimal factor, success or
//!    failure. Malformed factors are rejected without a record.
//! 4. Flow: `AlreadyKnown` tells the caller to stop submitting for this item.
//!
//! Journal write failures are logged and do not change the outcome.

use crate::admission::AdmissionGate;
use crate::config::{Config, RegistryConfig};
use crate::journal::{Journal, JournalKind, SubmissionRecord};
use crate::registry::{Registry, Reply, ResponseClassifier, SubmissionOutcome};
use crate::retry::{retry, RetryPolicy};
use crate::{is_decimal, Result, WorkItem};
use serde::Serialize;
use tracing::{error, info, warn};

/// Control signal returned after each submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The registry already knows this item's factorization from here on.
    StopEarly,
}

impl Flow {
    pub fn after(outcome: &SubmissionOutcome) -> Self {
        match outcome {
            SubmissionOutcome::AlreadyKnown => Flow::StopEarly,
            _ => Flow::Continue,
        }
    }
}

/// Per-item submission tally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmitSummary {
    pub submitted: usize,
    pub accepted: usize,
    pub already_known: usize,
    pub rejected: usize,
    /// Factors never sent because an earlier one was already known.
    pub skipped: usize,
    pub stopped_early: bool,
}

impl SubmitSummary {
    fn count(&mut self, outcome: &SubmissionOutcome) {
        self.submitted += 1;
        match outcome {
            SubmissionOutcome::Accepted => self.accepted += 1,
            SubmissionOutcome::AlreadyKnown => self.already_known += 1,
            SubmissionOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

/// Result of replaying the failure journal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    /// Claim files processed.
    pub files: usize,
    pub submissions: SubmitSummary,
    /// Unparseable lines written back to the failure journal.
    pub preserved: usize,
}

pub struct SubmissionPipeline<R> {
    registry: R,
    classifier: ResponseClassifier,
    policy: RetryPolicy,
    gate: AdmissionGate,
    success: Journal,
    failure: Journal,
}

impl<R: Registry> SubmissionPipeline<R> {
    pub fn new(
        registry: R,
        config: &RegistryConfig,
        gate: AdmissionGate,
        success: Journal,
        failure: Journal,
    ) -> Self {
        SubmissionPipeline {
            registry,
            classifier: ResponseClassifier::new(config),
            policy: config.retry_policy(),
            gate,
            success,
            failure,
        }
    }

    /// Build the gate and journals described by `config`.
    pub fn from_config(registry: R, config: &Config) -> Result<Self> {
        let gate = AdmissionGate::new(
            config.registry.admission_dir_or(&config.locks.dir),
            config.registry.max_concurrent,
        )?;
        let success = Journal::open(&config.journals.success, JournalKind::Success)?;
        let failure = Journal::open(&config.journals.failure, JournalKind::Failure)?;
        Ok(Self::new(registry, &config.registry, gate, success, failure))
    }

    pub fn failure_journal(&self) -> &Journal {
        &self.failure
    }

    /// Submit one factor and journal the outcome.
    pub fn submit(&self, item: &WorkItem, factor: &str) -> SubmissionOutcome {
        let outcome = match guard(item, factor) {
            Some(reason) => SubmissionOutcome::Rejected(reason.to_string()),
            None => self.post_with_retry(item, factor),
        };

        match &outcome {
            SubmissionOutcome::Accepted => info!(item = %item, factor, "factor accepted"),
            SubmissionOutcome::AlreadyKnown => {
                info!(item = %item, factor, "factor already known, stopping submissions for item")
            }
            SubmissionOutcome::Rejected(reason) => {
                warn!(item = %item, factor, reason = %reason, "factor rejected")
            }
        }

        if !is_decimal(factor) {
            // No journal line can hold it and replay could never parse it back.
            return outcome;
        }
        let record = SubmissionRecord::new(item, factor, outcome.clone());
        let journal = match record.kind() {
            JournalKind::Success => &self.success,
            JournalKind::Failure => &self.failure,
        };
        if let Err(e) = journal.append(&record) {
            error!(item = %item, factor, error = %e, "failed to write journal record");
        }
        outcome
    }

    /// Submit `factors` in order until done or the registry says stop.
    pub fn submit_all<'a>(
        &self,
        item: &WorkItem,
        factors: impl IntoIterator<Item = &'a str>,
    ) -> SubmitSummary {
        let mut summary = SubmitSummary::default();
        let mut factors = factors.into_iter();
        for factor in factors.by_ref() {
            let outcome = self.submit(item, factor);
            summary.count(&outcome);
            if Flow::after(&outcome) == Flow::StopEarly {
                summary.stopped_early = true;
                break;
            }
        }
        summary.skipped = factors.count();
        summary
    }

    /// Resubmit every record of the failure journal.
    ///
    /// The journal is first claimed by renaming it aside, so records that
    /// fail again land in a fresh failure journal through the normal path.
    /// Claims left by an interrupted replay are picked up too. Lines that do
    /// not parse are copied back unchanged.
    pub fn replay_failures(&self) -> Result<ReplaySummary> {
        let journal = &self.failure;
        journal.claim()?;
        let mut summary = ReplaySummary::default();
        for claimed in journal.pending_claims()? {
            let Some(_held) = journal.lock_claim(&claimed)? else {
                info!(file = %claimed.display(), "claim owned by another replay, skipping");
                continue;
            };
            let (entries, unparseable) = journal.read_file(&claimed)?;
            info!(
                file = %claimed.display(),
                records = entries.len(),
                unparseable = unparseable.len(),
                "replaying failed submissions"
            );
            for line in &unparseable {
                journal.append_raw(&format!("{}\n", line))?;
            }
            for entry in &entries {
                let outcome = self.submit(&entry.item, &entry.factor);
                summary.submissions.count(&outcome);
            }
            journal.finish_claim(&claimed)?;
            summary.files += 1;
            summary.preserved += unparseable.len();
        }
        Ok(summary)
    }

    fn post_with_retry(&self, item: &WorkItem, factor: &str) -> SubmissionOutcome {
        let retried = retry(
            self.policy,
            |attempt| {
                let reply = match self.gate.acquire() {
                    Ok(_permit) => self
                        .classifier
                        .classify(&self.registry.post_factor(item, factor)),
                    Err(e) => Reply::Transient(format!("admission gate: {}", e)),
                };
                if let Reply::Transient(reason) = &reply {
                    warn!(
                        item = %item,
                        factor,
                        attempt,
                        max = self.policy.max_attempts,
                        reason = %reason,
                        "submission attempt failed"
                    );
                }
                reply
            },
            |reply| matches!(reply, Reply::Definitive(_)),
        );
        match retried.value {
            Reply::Definitive(outcome) => outcome,
            Reply::Transient(reason) => SubmissionOutcome::Rejected(format!(
                "gave up after {} attempts: {}",
                retried.attempts, reason
            )),
        }
    }
}

/// Reason a factor must not be sent at all.
fn guard(item: &WorkItem, factor: &str) -> Option<&'static str> {
    if !is_decimal(factor) {
        Some("factor is not a decimal integer")
    } else if factor.trim_start_matches('0').is_empty()
        || factor.trim_start_matches('0') == "1"
        || factor == item.as_str()
    {
        Some("trivial factor")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalEntry;
    use crate::registry::TransportError;
    use std::cell::RefCell;
    use std::collections::{HashSet, VecDeque};
    use tempfile::TempDir;

    /// Replies from a queue, then repeats `fallback`; records every call.
    struct FakeRegistry {
        replies: RefCell<VecDeque<Result<String, TransportError>>>,
        fallback: Result<String, TransportError>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeRegistry {
        fn new(replies: Vec<Result<String, TransportError>>) -> Self {
            FakeRegistry {
                replies: RefCell::new(replies.into()),
                fallback: Ok("Factor submitted".into()),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn always(reply: Result<String, TransportError>) -> Self {
            FakeRegistry {
                fallback: reply,
                ..FakeRegistry::new(vec![])
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl Registry for FakeRegistry {
        fn post_factor(&self, _item: &WorkItem, factor: &str) -> Result<String, TransportError> {
            self.calls.borrow_mut().push(factor.to_string());
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    /// Remembers submitted factors the way the real registry does.
    struct RememberingRegistry {
        known: RefCell<HashSet<String>>,
    }

    impl Registry for RememberingRegistry {
        fn post_factor(&self, item: &WorkItem, factor: &str) -> Result<String, TransportError> {
            let key = format!("{}/{}", item, factor);
            if self.known.borrow_mut().insert(key) {
                Ok("Factor submitted".into())
            } else {
                Ok("Factor already known".into())
            }
        }
    }

    fn pipeline<R: Registry>(dir: &TempDir, registry: R) -> SubmissionPipeline<R> {
        let config = RegistryConfig {
            max_attempts: 3,
            retry_delay_secs: 0,
            ..RegistryConfig::default()
        };
        let gate = AdmissionGate::new(dir.path().join("slots"), 2).unwrap();
        let success = Journal::open(dir.path().join("ok.csv"), JournalKind::Success).unwrap();
        let failure = Journal::open(dir.path().join("failed.csv"), JournalKind::Failure).unwrap();
        SubmissionPipeline::new(registry, &config, gate, success, failure)
    }

    fn entries(dir: &TempDir, name: &str, kind: JournalKind) -> Vec<JournalEntry> {
        let journal = Journal::open(dir.path().join(name), kind).unwrap();
        journal.read_file(journal.path()).unwrap().0
    }

    fn item() -> WorkItem {
        WorkItem::parse("2305843009213693953").unwrap()
    }

    #[test]
    fn already_known_first_factor_stops_the_item() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::new(vec![Ok("Factor already known".into())]);
        let pipe = pipeline(&dir, &registry);
        let summary = pipe.submit_all(&item(), ["3", "5", "7"]);
        assert!(summary.stopped_early);
        assert_eq!(summary.already_known, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(registry.calls(), vec!["3"]);
        assert_eq!(entries(&dir, "ok.csv", JournalKind::Success).len(), 1);
    }

    #[test]
    fn one_failure_among_three_is_journaled_separately() {
        let dir = tempfile::tempdir().unwrap();
        let down = Err(TransportError("503 Service Unavailable".into()));
        let registry = FakeRegistry::new(vec![
            Ok("submitted".into()),
            down.clone(),
            down.clone(),
            down,
            Ok("submitted".into()),
        ]);
        let pipe = pipeline(&dir, &registry);
        let summary = pipe.submit_all(&item(), ["3", "5", "7"]);
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.rejected, 1);
        assert!(!summary.stopped_early);

        let ok = entries(&dir, "ok.csv", JournalKind::Success);
        let failed = entries(&dir, "failed.csv", JournalKind::Failure);
        let ok: Vec<_> = ok.iter().map(|e| (e.item.to_string(), e.factor.clone())).collect();
        assert_eq!(
            ok,
            vec![
                (item().to_string(), "3".to_string()),
                (item().to_string(), "7".to_string())
            ]
        );
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item, item());
        assert_eq!(failed[0].factor, "5");
    }

    #[test]
    fn always_failing_endpoint_is_called_max_attempts_times() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::always(Err(TransportError("connection refused".into())));
        let pipe = pipeline(&dir, &registry);
        match pipe.submit(&item(), "3") {
            SubmissionOutcome::Rejected(reason) => {
                assert!(reason.contains("after 3 attempts"), "{}", reason)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.calls().len(), 3);
    }

    #[test]
    fn error_token_is_retried_then_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::new(vec![Ok("Error: try later".into())]);
        let pipe = pipeline(&dir, &registry);
        assert_eq!(pipe.submit(&item(), "3"), SubmissionOutcome::Accepted);
        assert_eq!(registry.calls().len(), 2);
    }

    #[test]
    fn explicit_rejection_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::always(Ok("Does not divide".into()));
        let pipe = pipeline(&dir, &registry);
        assert!(matches!(
            pipe.submit(&item(), "3"),
            SubmissionOutcome::Rejected(_)
        ));
        assert_eq!(registry.calls().len(), 1);
    }

    #[test]
    fn trivial_factors_never_reach_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::new(vec![]);
        let pipe = pipeline(&dir, &registry);
        for factor in ["1", "2305843009213693953", "12a"] {
            assert!(matches!(
                pipe.submit(&item(), factor),
                SubmissionOutcome::Rejected(_)
            ));
        }
        assert!(registry.calls().is_empty());
        // Only the two decimal factors are journaled.
        assert_eq!(entries(&dir, "failed.csv", JournalKind::Failure).len(), 2);
        let raw = std::fs::read_to_string(dir.path().join("failed.csv")).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(!raw.contains("12a"));
    }

    #[test]
    fn rerun_reports_already_known_again() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RememberingRegistry {
            known: RefCell::new(HashSet::new()),
        };
        let pipe = pipeline(&dir, &registry);
        assert_eq!(pipe.submit(&item(), "3"), SubmissionOutcome::Accepted);
        assert_eq!(pipe.submit(&item(), "3"), SubmissionOutcome::AlreadyKnown);

        // A fresh pipeline keeps no memory of its own.
        let again = pipeline(&dir, &registry);
        assert_eq!(again.submit(&item(), "3"), SubmissionOutcome::AlreadyKnown);
        assert_eq!(entries(&dir, "ok.csv", JournalKind::Success).len(), 3);
    }

    #[test]
    fn replay_keeps_only_records_that_fail_again() {
        let dir = tempfile::tempdir().unwrap();
        let failed = Journal::open(dir.path().join("failed.csv"), JournalKind::Failure).unwrap();
        failed
            .append_raw(concat!(
                "2024-03-09T14:05:06Z,2305843009213693953,3\n",
                "garbage line\n",
                "2024-03-09T14:05:07Z,2305843009213693953,5\n",
            ))
            .unwrap();

        let registry = FakeRegistry::new(vec![
            Ok("submitted".into()),
            Ok("Does not divide".into()),
        ]);
        let pipe = pipeline(&dir, &registry);
        let summary = pipe.replay_failures().unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.preserved, 1);
        assert_eq!(summary.submissions.accepted, 1);
        assert_eq!(summary.submissions.rejected, 1);
        assert_eq!(registry.calls(), vec!["3", "5"]);

        let (left, bad) = failed.read_file(failed.path()).unwrap();
        assert_eq!(bad, vec!["garbage line".to_string()]);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].factor, "5");
        assert!(failed.pending_claims().unwrap().is_empty());
        assert_eq!(entries(&dir, "ok.csv", JournalKind::Success).len(), 1);
    }

    #[test]
    fn replay_of_empty_journal_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::new(vec![]);
        let summary = pipeline(&dir, &registry).replay_failures().unwrap();
        assert_eq!(summary, ReplaySummary::default());
        assert!(registry.calls().is_empty());
    }

    #[test]
    fn flow_follows_outcome() {
        assert_eq!(Flow::after(&SubmissionOutcome::AlreadyKnown), Flow::StopEarly);
        assert_eq!(Flow::after(&SubmissionOutcome::Accepted), Flow::Continue);
        assert_eq!(
            Flow::after(&SubmissionOutcome::Rejected("x".into())),
            Flow::Continue
        );
    }
}
