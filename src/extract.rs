//! Factor extraction from engine output.
//!
//! Each engine grammar is a [`FactorExtractor`] that turns raw output into a
//! typed sequence of [`Marker`]s. Two grammars are supported:
//!
//! | Grammar  | Size-tagged line         | Plain line          |
//! |----------|--------------------------|---------------------|
//! | `equals` | `P39 = 1234...`          | `factor = 1234...`  |
//! | `colon`  | `prp39 factor: 1234...`  | `factor: 1234...`   |
//!
//! Tags: `P`/`p` is a proven prime, `PRP`/`prp` a probable prime, `C`/`c` a
//! composite. Engines that print size-tagged lines list the complete
//! factorization with the remaining cofactor on the final tagged line; the
//! residual policy lives in [`Extraction::split_residual`], not in the
//! grammars.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Engine output grammar, selected per engine in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grammar {
    Equals,
    Colon,
}

impl Grammar {
    pub fn extractor(self) -> &'static dyn FactorExtractor {
        match self {
            Grammar::Equals => &EqualsGrammar,
            Grammar::Colon => &ColonGrammar,
        }
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grammar::Equals => write!(f, "equals"),
            Grammar::Colon => write!(f, "colon"),
        }
    }
}

/// What an engine said about a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    ProvenPrime,
    ProbablePrime,
    Composite,
    /// Untagged `factor` line.
    Plain,
}

impl MarkerKind {
    /// Size-tagged kinds belong to the engine's full factorization listing.
    pub fn is_tagged(self) -> bool {
        !matches!(self, MarkerKind::Plain)
    }

    fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "p" => MarkerKind::ProvenPrime,
            "prp" => MarkerKind::ProbablePrime,
            _ => MarkerKind::Composite,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub value: String,
}

/// Pluggable per-engine output parser.
pub trait FactorExtractor: Send + Sync {
    /// Parse a single output line. Returns `None` for lines that carry no value.
    fn parse_line(&self, line: &str) -> Option<Marker>;

    /// Parse complete output, preserving line order.
    fn extract(&self, output: &str) -> Extraction {
        Extraction {
            markers: output.lines().filter_map(|l| self.parse_line(l)).collect(),
        }
    }
}

/// Markers found in one engine run, in output order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub markers: Vec<Marker>,
}

impl Extraction {
    /// The remaining cofactor: the last size-tagged marker, if any.
    pub fn residual(&self) -> Option<&Marker> {
        self.markers.iter().rev().find(|m| m.kind.is_tagged())
    }

    /// True iff the engine certified the remaining cofactor as prime.
    pub fn proved_prime_cofactor(&self) -> bool {
        self.residual()
            .is_some_and(|m| m.kind == MarkerKind::ProvenPrime)
    }

    /// Candidate factor values with the residual cofactor removed.
    ///
    /// When the engine listed its factorization, the final tagged line reports
    /// the cofactor itself rather than a new factor, so exactly that entry is
    /// dropped. Plain `factor` lines are always kept.
    pub fn split_residual(&self) -> (Vec<&str>, Option<&Marker>) {
        let residual_index = self.markers.iter().rposition(|m| m.kind.is_tagged());
        let values = self
            .markers
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != residual_index)
            .map(|(_, m)| m.value.as_str())
            .collect();
        (values, residual_index.map(|i| &self.markers[i]))
    }
}

/// `P<digits> = <value>` / `PRP<digits> = <value>` / `C<digits> = <value>` /
/// `factor = <value>`.
pub struct EqualsGrammar;

/// `<tag><digits> factor: <value>` / `factor: <value>`.
pub struct ColonGrammar;

fn equals_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:(?i:(?P<tag>prp|p|c))(?P<size>\d+)|(?i:factor))\s*=\s*(?P<value>\d+)\s*$")
            .expect("static regex")
    })
}

fn colon_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:(?i:(?P<tag>prp|p|c))(?P<size>\d+)\s+)?(?i:factor)\s*:\s*(?P<value>\d+)\s*$")
            .expect("static regex")
    })
}

fn marker_from(re: &Regex, line: &str) -> Option<Marker> {
    let caps = re.captures(line)?;
    let value = caps.name("value")?.as_str().to_string();
    let kind = caps
        .name("tag")
        .map(|t| MarkerKind::from_tag(t.as_str()))
        .unwrap_or(MarkerKind::Plain);
    Some(Marker { kind, value })
}

impl FactorExtractor for EqualsGrammar {
    fn parse_line(&self, line: &str) -> Option<Marker> {
        marker_from(equals_regex(), line)
    }
}

impl FactorExtractor for ColonGrammar {
    fn parse_line(&self, line: &str) -> Option<Marker> {
        marker_from(colon_regex(), line)
    }
}
