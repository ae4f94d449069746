//! Shared test helpers for integration tests: a scratch workspace with fake
//! engine scripts and a config file pointing everything inside it.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One tier of a generated config; each tier gets its own engine entry.
pub struct Tier<'a> {
    pub engine: &'a str,
    pub program: &'a Path,
    pub grammar: &'a str,
    pub threads: u32,
    pub attempts: u32,
}

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Workspace {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write an executable `/bin/sh` script that runs `body`.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    /// Script that appends one line to `counter` per run, then prints `output`.
    pub fn counting_engine(&self, name: &str, output: &[&str]) -> PathBuf {
        let counter = self.path(&format!("{}.runs", name));
        let mut body = format!("echo run >> '{}'\n", counter.display());
        for line in output {
            body.push_str(&format!("echo '{}'\n", line));
        }
        self.script(name, &body)
    }

    /// How many times a [`Workspace::counting_engine`] ran.
    pub fn runs(&self, name: &str) -> usize {
        std::fs::read_to_string(self.path(&format!("{}.runs", name)))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// TOML config with locks, journals, and admission slots in the workspace.
    pub fn config_toml(&self, registry_url: &str, max_attempts: u32, tiers: &[Tier]) -> String {
        let mut toml = format!(
            "[locks]\ndir = {:?}\n\n[journals]\nsuccess = {:?}\nfailure = {:?}\n\n\
             [registry]\nurl = {:?}\nmax_attempts = {}\nretry_delay_secs = 0\n\
             connect_timeout_secs = 5\nrequest_timeout_secs = 10\n\n",
            self.path("locks").display().to_string(),
            self.path("submitted.csv").display().to_string(),
            self.path("failed.csv").display().to_string(),
            registry_url,
            max_attempts,
        );
        for tier in tiers {
            toml.push_str(&format!(
                "[engines.{}]\nprogram = {:?}\nargs = [\"{{threads}}\", \"{{number}}\"]\n\
                 grammar = {:?}\ntimeout_secs = 30\n\n",
                tier.engine,
                tier.program.display().to_string(),
                tier.grammar,
            ));
        }
        for tier in tiers {
            toml.push_str(&format!(
                "[[tiers]]\nengine = {:?}\nthreads = {}\nattempts = {}\n\n",
                tier.engine, tier.threads, tier.attempts
            ));
        }
        toml
    }

    pub fn write_config(&self, toml: &str) -> PathBuf {
        let path = self.path("factorwork.toml");
        std::fs::write(&path, toml).expect("write config");
        path
    }

    /// Non-empty lines of a workspace file (missing file = no lines).
    pub fn lines(&self, name: &str) -> Vec<String> {
        std::fs::read_to_string(self.path(name))
            .map(|s| {
                s.lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `(number, factor)` pairs from a journal, in file order.
    pub fn journal_pairs(&self, name: &str) -> Vec<(String, String)> {
        self.lines(name)
            .iter()
            .map(|line| {
                let mut parts = line.splitn(3, ',');
                let _ts = parts.next();
                let number = parts.next().unwrap_or_default().to_string();
                let factor = parts.next().unwrap_or_default().to_string();
                (number, factor)
            })
            .collect()
    }
}

pub fn pair(number: &str, factor: &str) -> (String, String) {
    (number.to_string(), factor.to_string())
}
