//! # Main — CLI Entry Point
//!
//! Routes subcommands to the handlers in `cli.rs`. Handles the shared
//! concerns: `.env` loading, logging setup, and configuration overrides.
//!
//! ## Subcommands
//!
//! - `run`: the batch driver over stdin or `--input`. SIGINT/SIGTERM or
//!   `--exit-after` stop it between items.
//! - `factor`: factor one number and print the result as JSON (no lock, no submission).
//! - `submit`: report one factor through the submission pipeline.
//! - `resubmit`: replay the failure journal.
//! - `check`: validate the configuration and locate engine binaries.
//!
//! ## Global Options
//!
//! - `--config` / `FACTORWORK_CONFIG`: TOML configuration file.
//! - `--registry-url` / `FACTORWORK_REGISTRY_URL`: override `[registry] url`.
//! - `--lock-dir`, `--success-journal`, `--failure-journal`: path overrides.
//!
//! `LOG_FORMAT=json` switches to JSON log lines; `RUST_LOG` sets the level.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "factorwork",
    version,
    about = "Claim composite numbers, factor them with external engines, and report factors"
)]
struct Cli {
    /// TOML configuration file (default: factorwork.toml if present)
    #[arg(long, env = "FACTORWORK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Registry submission URL
    #[arg(long, env = "FACTORWORK_REGISTRY_URL", global = true)]
    registry_url: Option<String>,

    /// Directory holding per-item lock files
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    /// Journal of accepted and already-known submissions
    #[arg(long, global = true)]
    success_journal: Option<PathBuf>,

    /// Journal of rejected submissions
    #[arg(long, global = true)]
    failure_journal: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process work items, one decimal number per line
    Run {
        /// Read work items from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
        /// Write a JSON summary here when the run ends
        #[arg(long)]
        summary: Option<PathBuf>,
        /// Stop after claiming this many items
        #[arg(long)]
        max_items: Option<u64>,
        /// Claim no new item after this many seconds
        #[arg(long, value_name = "SECS")]
        exit_after: Option<u64>,
    },
    /// Factor one number and print the result as JSON
    Factor {
        /// Decimal number to factor
        number: String,
    },
    /// Submit one factor of a number to the registry
    Submit {
        /// Decimal number the factor divides
        number: String,
        /// Decimal factor
        factor: String,
    },
    /// Resubmit every record in the failure journal
    Resubmit,
    /// Validate configuration and locate engine binaries
    Check,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let config = cli::load_config(&cli)?;

    match &cli.command {
        Commands::Run {
            input,
            summary,
            max_items,
            exit_after,
        } => cli::run_batch(
            &config,
            input.as_deref(),
            summary.as_deref(),
            *max_items,
            *exit_after,
        ),
        Commands::Factor { number } => cli::factor_one(&config, number),
        Commands::Submit { number, factor } => cli::submit_one(&config, number, factor),
        Commands::Resubmit => cli::resubmit(&config),
        Commands::Check => cli::check(&config),
    }
}
