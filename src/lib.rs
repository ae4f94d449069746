//! # factorwork — Distributed Factoring Worker
//!
//! Claims composite numbers from an input stream, factors them with external
//! engines under a tiered attempt budget, and reports each factor to a remote
//! registry.
//!
//! ```text
//! input lines ─> lock (skip busy) ─> fallback tiers ─> engine runs ─> factors
//!                                                                        │
//!                      journals <─ classify <─ retry + admission gate <──┘
//! ```
//!
//! Any number of worker processes may share one lock directory; each item is
//! processed by at most one of them at a time.

pub mod admission;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod journal;
pub mod lock;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod submit;

pub use error::{Error, Result};

use std::fmt;
use std::str::FromStr;

/// A composite awaiting factorization, kept as its exact decimal string.
///
/// Identity is the string itself: two items are the same only if their
/// decimal representations are byte-identical. Parsing rejects anything that
/// is not a canonical positive decimal (digits only, no leading zero), so the
/// lock namespace and the journals never see two spellings of one number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem(String);

impl WorkItem {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidWorkItem {
                input: s.to_string(),
                reason: "empty",
            });
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidWorkItem {
                input: s.to_string(),
                reason: "not a decimal integer",
            });
        }
        if s.starts_with('0') {
            return Err(Error::InvalidWorkItem {
                input: s.to_string(),
                reason: "leading zero",
            });
        }
        Ok(WorkItem(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decimal digit count.
    pub fn digits(&self) -> usize {
        self.0.len()
    }

    /// Longest decimal string that can be a genuine smallest factor:
    /// `floor(digits / 2) + 2`. Anything longer is a parsing artifact.
    pub fn max_factor_digits(&self) -> usize {
        max_factor_digits(self.digits())
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkItem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WorkItem::parse(s)
    }
}

impl AsRef<str> for WorkItem {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Digit-count bound for factors of a number with `digits` decimal digits.
pub fn max_factor_digits(digits: usize) -> usize {
    digits / 2 + 2
}

/// True if `s` is a non-empty run of ASCII digits.
pub fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
