//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. One function per
//! subcommand, plus configuration loading with command-line overrides.
//! Results meant for scripts go to stdout as JSON; everything else is logged.

use anyhow::{Context, Result};
use factorwork::config::Config;
use factorwork::driver::BatchDriver;
use factorwork::engine::{self, EngineRunner};
use factorwork::fallback::FallbackController;
use factorwork::lock::LockManager;
use factorwork::progress::Progress;
use factorwork::registry::{HttpRegistry, SubmissionOutcome};
use factorwork::submit::SubmissionPipeline;
use factorwork::WorkItem;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::Cli;

/// Load the config file, apply command-line overrides, and validate.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = &cli.registry_url {
        config.registry.url = url.clone();
    }
    if let Some(dir) = &cli.lock_dir {
        config.locks.dir = dir.clone();
    }
    if let Some(path) = &cli.success_journal {
        config.journals.success = path.clone();
    }
    if let Some(path) = &cli.failure_journal {
        config.journals.failure = path.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn pipeline(config: &Config) -> Result<SubmissionPipeline<HttpRegistry>> {
    let registry = HttpRegistry::new(&config.registry);
    SubmissionPipeline::from_config(registry, config).context("setting up submission pipeline")
}

// ── Batch ───────────────────────────────────────────────────────

pub fn run_batch(
    config: &Config,
    input: Option<&Path>,
    summary_path: Option<&Path>,
    max_items: Option<u64>,
    exit_after: Option<u64>,
) -> Result<()> {
    let engines = engine::check_available(config).context("engine check failed")?;
    for (name, path) in &engines {
        info!(engine = %name, path = %path.display(), "engine available");
    }

    let locks = LockManager::new(&config.locks.dir).context("opening lock directory")?;
    let controller = FallbackController::new(EngineRunner::from_config(config), config.tiers.clone());
    let pipeline = pipeline(config)?;
    let progress = Progress::new();
    let reporter = progress.start_reporter();

    info!(
        lock_dir = %config.locks.dir.display(),
        registry = %config.registry.url,
        tiers = config.tiers.len(),
        max_items = ?max_items,
        "factorwork starting"
    );

    let stop = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(Arc::clone(&stop));
    let deadline = exit_after.map(|secs| Instant::now() + Duration::from_secs(secs));

    let driver = BatchDriver::new(locks, controller, pipeline, progress.clone())
        .with_max_items(max_items)
        .with_stop(stop)
        .with_deadline(deadline);
    let result = match input {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening input {}", path.display()))?;
            driver.run(BufReader::new(file))
        }
        None => driver.run(std::io::stdin().lock()),
    };

    progress.stop();
    let _ = reporter.join();
    progress.print_status();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "batch aborted");
            return Err(e).context("batch aborted");
        }
    };
    info!(
        claimed = summary.counters.claimed,
        busy = summary.counters.busy,
        invalid = summary.counters.invalid,
        fully_factored = summary.fully_factored,
        stopped_early = summary.stopped_early,
        failed = summary.failed,
        interrupted = summary.interrupted,
        "batch finished"
    );

    if let Some(path) = summary_path {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json).with_context(|| format!("writing summary {}", path.display()))?;
    }
    Ok(())
}

/// Set `stop` on SIGINT or SIGTERM. The listener runs on its own thread with a
/// single-threaded runtime; the worker itself stays blocking.
fn spawn_signal_listener(stop: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "signal listener unavailable, stop with SIGKILL only");
                return;
            }
        };
        rt.block_on(async {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        tokio::select! {
                            _ = ctrl_c => {},
                            _ = sigterm.recv() => {},
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "SIGTERM handler unavailable");
                        let _ = ctrl_c.await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("stop requested, finishing current item");
            stop.store(true, Ordering::Relaxed);
        });
    });
}

// ── Single-Item Commands ────────────────────────────────────────

pub fn factor_one(config: &Config, number: &str) -> Result<()> {
    let item = WorkItem::parse(number)?;
    engine::check_available(config).context("engine check failed")?;
    let controller = FallbackController::new(EngineRunner::from_config(config), config.tiers.clone());
    let result = controller.factor_all(&item)?;
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &result)?;
    writeln!(out)?;
    Ok(())
}

pub fn submit_one(config: &Config, number: &str, factor: &str) -> Result<()> {
    let item = WorkItem::parse(number)?;
    if !factorwork::is_decimal(factor) {
        anyhow::bail!("factor '{}' is not a decimal integer", factor);
    }
    let outcome = pipeline(config)?.submit(&item, factor);
    let reason = match &outcome {
        SubmissionOutcome::Rejected(reason) => Some(reason.as_str()),
        _ => None,
    };
    println!(
        "{}",
        serde_json::json!({
            "item": item.as_str(),
            "factor": factor,
            "outcome": outcome.label(),
            "reason": reason,
        })
    );
    if reason.is_some() {
        anyhow::bail!("submission rejected");
    }
    Ok(())
}

pub fn resubmit(config: &Config) -> Result<()> {
    let pipeline = pipeline(config)?;
    let summary = pipeline
        .replay_failures()
        .context("replaying failure journal")?;
    info!(
        files = summary.files,
        accepted = summary.submissions.accepted,
        already_known = summary.submissions.already_known,
        rejected = summary.submissions.rejected,
        preserved = summary.preserved,
        "resubmission finished"
    );
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

pub fn check(config: &Config) -> Result<()> {
    let engines = engine::check_available(config)?;
    for (name, path) in &engines {
        println!("{}\t{}", name, path.display());
    }
    for (index, tier) in config.tiers.iter().enumerate() {
        info!(
            tier = index + 1,
            engine = %tier.engine,
            threads = tier.threads,
            attempts = tier.attempts,
            "tier"
        );
    }
    Ok(())
}
