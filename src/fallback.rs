//! # Fallback — Tiered Engine Controller
//!
//! Drives the engine executor through the configured tiers for one work item:
//!
//! ```text
//! tier 1: engine A, T1 threads, up to K attempts ──proved──> done
//!            │ budget exhausted
//!            v
//! tier 2: engine B, T2 threads, 1 attempt ─────────proved──> done
//!            │ exhausted
//!            v
//!        done (partial)
//! ```
//!
//! Factors from every attempt are merged in discovery order without
//! duplicates. Partial results are valid: an item whose cofactor was never
//! proven prime still yields every factor found along the way.

use crate::config::TierConfig;
use crate::engine::{EngineExecutor, EngineRun};
use crate::{Error, Result, WorkItem};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{info, warn};

/// One execution of one engine against one item.
#[derive(Debug, Clone, Serialize)]
pub struct EngineAttempt {
    /// 1-based tier index.
    pub tier: usize,
    /// 1-based attempt index within the tier.
    pub attempt: u32,
    pub engine: String,
    pub threads: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub factors_found: usize,
    pub proved_prime_cofactor: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Set when the attempt failed before producing a run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub raw_log: String,
}

impl EngineAttempt {
    fn from_run(tier: usize, attempt: u32, run: &EngineRun) -> Self {
        EngineAttempt {
            tier,
            attempt,
            engine: run.engine.clone(),
            threads: run.threads,
            started_at: run.started_at,
            elapsed_ms: run.elapsed.as_millis() as u64,
            factors_found: run.factors.len(),
            proved_prime_cofactor: run.proved_prime_cofactor,
            exit_code: run.exit_code,
            timed_out: run.timed_out,
            error: None,
            raw_log: run.raw_log.clone(),
        }
    }

    fn failed(
        tier: usize,
        attempt: u32,
        config: &TierConfig,
        started_at: DateTime<Utc>,
        started: Instant,
        error: &Error,
    ) -> Self {
        EngineAttempt {
            tier,
            attempt,
            engine: config.engine.clone(),
            threads: config.threads,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            factors_found: 0,
            proved_prime_cofactor: false,
            exit_code: None,
            timed_out: false,
            error: Some(error.to_string()),
            raw_log: String::new(),
        }
    }
}

/// Everything the controller learned about one item.
#[derive(Debug, Clone, Serialize)]
pub struct FactorResult {
    pub item: String,
    /// Deduplicated across all attempts and tiers, in discovery order.
    pub factors: Vec<String>,
    /// Engine of the last attempt made.
    pub final_engine: String,
    pub proved_prime_cofactor: bool,
    pub attempts: Vec<EngineAttempt>,
}

pub struct FallbackController<E> {
    executor: E,
    tiers: Vec<TierConfig>,
}

impl<E: EngineExecutor> FallbackController<E> {
    pub fn new(executor: E, tiers: Vec<TierConfig>) -> Self {
        FallbackController { executor, tiers }
    }

    pub fn tiers(&self) -> &[TierConfig] {
        &self.tiers
    }

    /// Factor `item`, stopping at the first attempt that proves the cofactor
    /// prime. Only fatal (environment) errors are returned; anything else an
    /// attempt raises counts as an unproven attempt.
    pub fn factor_all(&self, item: &WorkItem) -> Result<FactorResult> {
        if self.tiers.is_empty() {
            return Err(Error::Config("no factoring tiers configured".into()));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut factors = Vec::new();
        let mut attempts = Vec::new();
        let mut final_engine = self.tiers[0].engine.clone();

        for (index, tier) in self.tiers.iter().enumerate() {
            let tier_no = index + 1;
            for attempt in 1..=tier.attempts {
                final_engine = tier.engine.clone();
                info!(
                    item = %item,
                    tier = tier_no,
                    engine = %tier.engine,
                    threads = tier.threads,
                    attempt,
                    of = tier.attempts,
                    "running factoring attempt"
                );
                let started_at = Utc::now();
                let started = Instant::now();
                let run = match self.executor.run(item, tier) {
                    Ok(run) => run,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(item = %item, engine = %tier.engine, attempt, error = %e, "attempt failed");
                        attempts.push(EngineAttempt::failed(
                            tier_no, attempt, tier, started_at, started, &e,
                        ));
                        continue;
                    }
                };

                for factor in &run.factors {
                    if seen.insert(factor.clone()) {
                        factors.push(factor.clone());
                    }
                }
                attempts.push(EngineAttempt::from_run(tier_no, attempt, &run));

                if run.proved_prime_cofactor {
                    info!(
                        item = %item,
                        engine = %tier.engine,
                        factors = factors.len(),
                        "cofactor proven prime"
                    );
                    return Ok(FactorResult {
                        item: item.to_string(),
                        factors,
                        final_engine,
                        proved_prime_cofactor: true,
                        attempts,
                    });
                }
            }
            if index + 1 < self.tiers.len() {
                info!(
                    item = %item,
                    engine = %tier.engine,
                    next = %self.tiers[index + 1].engine,
                    "tier exhausted without proof, falling back"
                );
            }
        }

        warn!(
            item = %item,
            factors = factors.len(),
            "all tiers exhausted without proving the cofactor prime"
        );
        Ok(FactorResult {
            item: item.to_string(),
            factors,
            final_engine,
            proved_prime_cofactor: false,
            attempts,
        })
    }
}
