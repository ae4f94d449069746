//! # Config — Worker Configuration
//!
//! TOML configuration for the factoring worker. Maps to the `[locks]`,
//! `[journals]`, `[registry]`, `[engines.<name>]` and `[[tiers]]` sections of
//! `factorwork.toml`. Every section has defaults, so an empty file (or no file
//! at all) yields the stock two-tier setup.
//!
//! Tier parameters (engine, thread budget, attempt count) are data: earlier
//! deployments disagreed on them, so nothing here hard-codes a schedule
//! beyond the defaults.

use crate::extract::Grammar;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "factorwork.toml";

/// Top-level configuration parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub journals: JournalConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default = "default_engines")]
    pub engines: BTreeMap<String, EngineConfig>,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

/// The `[locks]` section: where the per-item lock namespace lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
}

/// The `[journals]` section: append-only submission logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JournalConfig {
    #[serde(default = "default_success_journal")]
    pub success: PathBuf,
    #[serde(default = "default_failure_journal")]
    pub failure: PathBuf,
}

/// The `[registry]` section: remote endpoint, response tokens, retry and
/// throttling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub url: String,
    /// Body substring acknowledging a submission.
    #[serde(default = "default_accepted_token")]
    pub accepted_token: String,
    /// Body substring meaning the registry already had this factor.
    #[serde(default = "default_already_known_token")]
    pub already_known_token: String,
    /// Body substring marking a transient server-side error (retried).
    #[serde(default = "default_error_token")]
    pub error_token: Option<String>,
    /// Total calls per factor before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Admission slots shared by every process using the same `admission_dir`.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Directory for admission slot files (defaults to the lock directory).
    #[serde(default)]
    pub admission_dir: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// One `[engines.<name>]` entry: how to launch an engine and read its output.
///
/// `args` and `stdin` may contain `{number}` and `{threads}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    pub grammar: Grammar,
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

/// One `[[tiers]]` entry, tried in file order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    pub engine: String,
    pub threads: u32,
    pub attempts: u32,
}

// ── Defaults ────────────────────────────────────────────────────

fn default_lock_dir() -> PathBuf {
    PathBuf::from("locks")
}

fn default_success_journal() -> PathBuf {
    PathBuf::from("submitted.csv")
}

fn default_failure_journal() -> PathBuf {
    PathBuf::from("failed-submissions.csv")
}

fn default_registry_url() -> String {
    "https://factordb.com/reportfactor.php".to_string()
}

fn default_accepted_token() -> String {
    "submitted".to_string()
}

fn default_already_known_token() -> String {
    "already known".to_string()
}

fn default_error_token() -> Option<String> {
    Some("Error".to_string())
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    3
}

fn default_max_concurrent() -> usize {
    2
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_engine_timeout_secs() -> u64 {
    6 * 3600
}

fn default_engines() -> BTreeMap<String, EngineConfig> {
    let mut engines = BTreeMap::new();
    engines.insert(
        "yafu".to_string(),
        EngineConfig {
            program: "yafu".to_string(),
            args: vec!["-threads".to_string(), "{threads}".to_string()],
            stdin: Some("factor({number})".to_string()),
            grammar: Grammar::Equals,
            timeout_secs: default_engine_timeout_secs(),
        },
    );
    engines.insert(
        "msieve".to_string(),
        EngineConfig {
            program: "msieve".to_string(),
            args: vec![
                "-q".to_string(),
                "-t".to_string(),
                "{threads}".to_string(),
                "{number}".to_string(),
            ],
            stdin: None,
            grammar: Grammar::Colon,
            timeout_secs: default_engine_timeout_secs(),
        },
    );
    engines
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            engine: "yafu".to_string(),
            threads: 2,
            attempts: 3,
        },
        TierConfig {
            engine: "msieve".to_string(),
            threads: 4,
            attempts: 1,
        },
    ]
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            dir: default_lock_dir(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            success: default_success_journal(),
            failure: default_failure_journal(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            url: default_registry_url(),
            accepted_token: default_accepted_token(),
            already_known_token: default_already_known_token(),
            error_token: default_error_token(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            max_concurrent: default_max_concurrent(),
            admission_dir: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            locks: LockConfig::default(),
            journals: JournalConfig::default(),
            registry: RegistryConfig::default(),
            engines: default_engines(),
            tiers: default_tiers(),
        }
    }
}

// ── Loading and Validation ──────────────────────────────────────

impl Config {
    /// Parse and validate a TOML document.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `factorwork.toml` in the
    /// working directory is used when present, the built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !p.exists() {
                    return Ok(Config::default());
                }
                p
            }
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Config::parse(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(Error::Config("at least one [[tiers]] entry is required".into()));
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if !self.engines.contains_key(&tier.engine) {
                return Err(Error::Config(format!(
                    "tier {} names unknown engine '{}'",
                    i + 1,
                    tier.engine
                )));
            }
            if tier.threads == 0 {
                return Err(Error::Config(format!("tier {} has zero threads", i + 1)));
            }
            if tier.attempts == 0 {
                return Err(Error::Config(format!("tier {} has zero attempts", i + 1)));
            }
        }
        for (name, engine) in &self.engines {
            if engine.program.trim().is_empty() {
                return Err(Error::Config(format!("engine '{}' has an empty program", name)));
            }
            if engine.timeout_secs == 0 {
                return Err(Error::Config(format!("engine '{}' has a zero timeout", name)));
            }
        }
        let r = &self.registry;
        if r.url.trim().is_empty() {
            return Err(Error::Config("registry url is empty".into()));
        }
        if r.accepted_token.is_empty() || r.already_known_token.is_empty() {
            return Err(Error::Config("registry response tokens must be non-empty".into()));
        }
        if r.error_token.as_deref() == Some("") {
            return Err(Error::Config("registry error_token must be non-empty when set".into()));
        }
        if r.max_attempts == 0 {
            return Err(Error::Config("registry max_attempts must be at least 1".into()));
        }
        if r.max_concurrent == 0 {
            return Err(Error::Config("registry max_concurrent must be at least 1".into()));
        }
        Ok(())
    }

    /// Engines referenced by at least one tier, in tier order, without repeats.
    pub fn tier_engines(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for tier in &self.tiers {
            if !names.contains(&tier.engine.as_str()) {
                names.push(&tier.engine);
            }
        }
        names
    }
}

impl RegistryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    /// Admission slot directory, falling back to the lock namespace.
    pub fn admission_dir_or<'a>(&'a self, lock_dir: &'a Path) -> &'a Path {
        self.admission_dir.as_deref().unwrap_or(lock_dir)
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
