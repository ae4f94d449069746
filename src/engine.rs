//! # Engine — Factoring Engine Subprocess Runner
//!
//! Runs one external factoring engine against one work item with a thread
//! budget and a wall-clock limit, streams its combined stdout/stderr, and turns
//! the output into an ordered, deduplicated list of factor strings.
//!
//! ## Invocation
//!
//! The engine's `args` and optional `stdin` templates are expanded with
//! `{number}` (the decimal work item) and `{threads}`. When a stdin template is
//! set it is written to the child followed by a newline and the pipe is closed.
//!
//! ## Output handling
//!
//! 1. Lines from both pipes are collected in arrival order and echoed at
//!    `debug` level.
//! 2. The engine's grammar turns lines into markers (see [`crate::extract`]).
//! 3. The residual cofactor (final size-tagged marker) is removed.
//! 4. Values longer than `floor(digits / 2) + 2`, trivial values, and the item
//!    itself are discarded.
//! 5. Duplicates are dropped, first occurrence wins.
//!
//! A nonzero exit or a timeout is not an error: the run simply reports
//! `proved_prime_cofactor = false` with whatever was parsed. Only a missing or
//! unlaunchable binary is an error, and it is fatal to the batch.

use crate::config::{Config, EngineConfig, TierConfig};
use crate::{Error, Result, WorkItem};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SPAWN_RETRIES: u32 = 20;

/// Outcome of one engine execution.
#[derive(Debug, Clone)]
pub struct EngineRun {
    pub engine: String,
    pub threads: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Ordered, deduplicated factors that passed the digit bound.
    pub factors: Vec<String>,
    /// Values dropped for exceeding the digit bound.
    pub discarded: Vec<String>,
    pub proved_prime_cofactor: bool,
    /// `None` when the process was killed or its status could not be read.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub raw_log: String,
}

/// Executes a tier's engine against an item. The seam the fallback controller
/// drives; [`EngineRunner`] is the subprocess implementation.
pub trait EngineExecutor {
    fn run(&self, item: &WorkItem, tier: &TierConfig) -> Result<EngineRun>;
}

/// Subprocess-backed executor over the configured engines.
#[derive(Debug, Clone)]
pub struct EngineRunner {
    engines: BTreeMap<String, EngineConfig>,
}

impl EngineRunner {
    pub fn new(engines: BTreeMap<String, EngineConfig>) -> Self {
        EngineRunner { engines }
    }

    pub fn from_config(config: &Config) -> Self {
        EngineRunner::new(config.engines.clone())
    }
}

impl EngineExecutor for EngineRunner {
    fn run(&self, item: &WorkItem, tier: &TierConfig) -> Result<EngineRun> {
        let engine = self.engines.get(&tier.engine).ok_or_else(|| {
            Error::Config(format!("tier names unknown engine '{}'", tier.engine))
        })?;
        run(item, &tier.engine, engine, tier.threads, item.max_factor_digits())
    }
}

/// Run `engine` once against `item`.
pub fn run(
    item: &WorkItem,
    name: &str,
    engine: &EngineConfig,
    threads: u32,
    max_factor_digits: usize,
) -> Result<EngineRun> {
    let args: Vec<String> = engine
        .args
        .iter()
        .map(|a| expand(a, item, threads))
        .collect();

    let mut cmd = Command::new(&engine.program);
    cmd.args(&args)
        .stdin(if engine.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started_at = Utc::now();
    let start = Instant::now();
    let mut child = spawn(&mut cmd).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::EngineMissing {
                engine: name.to_string(),
                program: engine.program.clone(),
            }
        } else {
            Error::EngineSpawn {
                engine: name.to_string(),
                source: e,
            }
        }
    })?;
    info!(item = %item, engine = name, threads, "engine started");

    if let Some(template) = &engine.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let input = format!("{}\n", expand(template, item, threads));
            // A child that exits without reading its input is not our failure.
            if let Err(e) = stdin.write_all(input.as_bytes()) {
                debug!(engine = name, error = %e, "engine closed stdin early");
            }
        }
    }

    let (tx, rx) = mpsc::channel::<String>();
    if let Some(out) = child.stdout.take() {
        spawn_line_reader(out, tx.clone());
    }
    if let Some(err) = child.stderr.take() {
        spawn_line_reader(err, tx.clone());
    }
    drop(tx);

    let deadline = start + engine.timeout();
    let mut raw_log = String::new();
    let mut timed_out = false;
    loop {
        let now = Instant::now();
        if now >= deadline {
            timed_out = true;
            break;
        }
        match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
            Ok(line) => {
                debug!(engine = name, "{}", line);
                raw_log.push_str(&line);
                raw_log.push('\n');
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = if timed_out {
        kill(&mut child)
    } else {
        let (status, expired) = wait_until(&mut child, deadline)?;
        timed_out = expired;
        status
    };
    for line in rx.try_iter() {
        raw_log.push_str(&line);
        raw_log.push('\n');
    }

    let elapsed = start.elapsed();
    let extraction = engine.grammar.extractor().extract(&raw_log);
    let proved_prime_cofactor = extraction.proved_prime_cofactor();
    let (values, residual) = extraction.split_residual();
    if let Some(residual) = residual {
        debug!(engine = name, residual = %residual.value, kind = ?residual.kind, "residual cofactor");
    }
    let (factors, discarded) = collect_factors(item, values, max_factor_digits);
    for value in &discarded {
        warn!(item = %item, engine = name, digits = value.len(), max_factor_digits, "discarding oversized factor");
    }

    let exit_code = status.and_then(|s| s.code());
    if timed_out {
        warn!(item = %item, engine = name, timeout_secs = engine.timeout_secs, "engine timed out");
    } else if exit_code != Some(0) {
        warn!(item = %item, engine = name, exit_code = ?exit_code, "engine exited unsuccessfully");
    }
    info!(
        item = %item,
        engine = name,
        threads,
        factors = factors.len(),
        proved_prime_cofactor,
        elapsed_ms = elapsed.as_millis() as u64,
        "engine finished"
    );

    Ok(EngineRun {
        engine: name.to_string(),
        threads,
        started_at,
        elapsed,
        factors,
        discarded,
        proved_prime_cofactor,
        exit_code,
        timed_out,
        raw_log,
    })
}

/// Spawn, retrying briefly while the program file is still open for writing
/// somewhere (`ETXTBSY`), as happens right after an engine binary is replaced.
fn spawn(cmd: &mut Command) -> std::io::Result<Child> {
    let mut tries = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && tries < SPAWN_RETRIES => {
                tries += 1;
                thread::sleep(POLL_INTERVAL);
            }
            other => return other,
        }
    }
}

/// Apply the digit bound, trivial-value filter, and first-seen deduplication.
///
/// Returns `(kept, discarded_for_length)`.
pub fn collect_factors<'a>(
    item: &WorkItem,
    values: impl IntoIterator<Item = &'a str>,
    max_factor_digits: usize,
) -> (Vec<String>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut discarded = Vec::new();
    for value in values {
        if value.len() > max_factor_digits {
            discarded.push(value.to_string());
            continue;
        }
        if is_trivial(value) || value == item.as_str() {
            continue;
        }
        if seen.insert(value) {
            kept.push(value.to_string());
        }
    }
    (kept, discarded)
}

/// `0` and `1` (with any leading zeros) divide nothing useful.
pub fn is_trivial(value: &str) -> bool {
    matches!(value.trim_start_matches('0'), "" | "1")
}

fn expand(template: &str, item: &WorkItem, threads: u32) -> String {
    template
        .replace("{number}", item.as_str())
        .replace("{threads}", &threads.to_string())
}

fn spawn_line_reader(pipe: impl Read + Send + 'static, tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        // Engines print progress bars and locale-dependent bytes; decode
        // lossily and keep draining so the child never blocks on a full pipe.
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Wait for exit until `deadline`; kills the child if it is still running then.
/// Returns the exit status (if any) and whether the deadline expired.
fn wait_until(child: &mut Child, deadline: Instant) -> Result<(Option<ExitStatus>, bool)> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((Some(status), false));
        }
        if Instant::now() >= deadline {
            return Ok((kill(child), true));
        }
        thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

fn kill(child: &mut Child) -> Option<ExitStatus> {
    let _ = child.kill();
    child.wait().ok()
}

// ── Binary discovery ────────────────────────────────────────────

/// Resolve an engine program: paths are checked directly, bare names are
/// searched in `PATH`.
pub fn locate(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return is_executable(path).then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Verify every engine a tier refers to can be found. Returns the resolved
/// paths in tier order.
pub fn check_available(config: &Config) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    for name in config.tier_engines() {
        let engine = config
            .engines
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown engine '{}'", name)))?;
        match locate(&engine.program) {
            Some(path) => found.push((name.to_string(), path)),
            None => {
                return Err(Error::EngineMissing {
                    engine: name.to_string(),
                    program: engine.program.clone(),
                })
            }
        }
    }
    Ok(found)
}
