//! Remote factor registry client.
//!
//! A submission is an HTTP POST of the form fields `number` and `factor`.
//! The registry answers with an HTML/text body; what it means is decided by
//! substring tokens from [`RegistryConfig`]:
//!
//! - `already_known_token` present → [`SubmissionOutcome::AlreadyKnown`]
//!   (wins over everything else)
//! - `error_token` present → transient, retry
//! - `accepted_token` present → [`SubmissionOutcome::Accepted`]
//! - anything else → [`SubmissionOutcome::Rejected`]
//!
//! Transport errors and non-2xx statuses are transient too.

use crate::config::RegistryConfig;
use crate::WorkItem;
use std::time::Duration;

/// Terminal classification of one submitted factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted,
    AlreadyKnown,
    Rejected(String),
}

impl SubmissionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SubmissionOutcome::Accepted => "accepted",
            SubmissionOutcome::AlreadyKnown => "already_known",
            SubmissionOutcome::Rejected(_) => "rejected",
        }
    }
}

/// Transport-level failure of one registry call (connection, timeout, status).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// One registry call. Returns the response body of a 2xx reply.
pub trait Registry {
    fn post_factor(&self, item: &WorkItem, factor: &str) -> Result<String, TransportError>;
}

impl<R: Registry + ?Sized> Registry for &R {
    fn post_factor(&self, item: &WorkItem, factor: &str) -> Result<String, TransportError> {
        (**self).post_factor(item, factor)
    }
}

/// Blocking HTTP registry over a shared `ureq` agent.
pub struct HttpRegistry {
    url: String,
    agent: ureq::Agent,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_connect(Some(Duration::from_secs(config.connect_timeout_secs)))
                .timeout_global(Some(Duration::from_secs(config.request_timeout_secs)))
                .build(),
        );
        HttpRegistry {
            url: config.url.clone(),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Registry for HttpRegistry {
    fn post_factor(&self, item: &WorkItem, factor: &str) -> Result<String, TransportError> {
        let mut resp = self
            .agent
            .post(&self.url)
            .send_form([("number", item.as_str()), ("factor", factor)])
            .map_err(|e| TransportError(e.to_string()))?;
        resp.body_mut()
            .read_to_string()
            .map_err(|e| TransportError(format!("reading response body: {}", e)))
    }
}

/// What a single call's result means for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Final answer; stop retrying.
    Definitive(SubmissionOutcome),
    /// Worth another try.
    Transient(String),
}

#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    accepted: String,
    already_known: String,
    error: Option<String>,
}

impl ResponseClassifier {
    pub fn new(config: &RegistryConfig) -> Self {
        ResponseClassifier {
            accepted: config.accepted_token.clone(),
            already_known: config.already_known_token.clone(),
            error: config.error_token.clone().filter(|t| !t.is_empty()),
        }
    }

    pub fn classify(&self, reply: &Result<String, TransportError>) -> Reply {
        let body = match reply {
            Ok(body) => body,
            Err(e) => return Reply::Transient(e.0.clone()),
        };
        if body.contains(&self.already_known) {
            return Reply::Definitive(SubmissionOutcome::AlreadyKnown);
        }
        if let Some(token) = &self.error {
            if body.contains(token.as_str()) {
                return Reply::Transient(format!("registry reported an error: {}", excerpt(body)));
            }
        }
        if body.contains(&self.accepted) {
            return Reply::Definitive(SubmissionOutcome::Accepted);
        }
        Reply::Definitive(SubmissionOutcome::Rejected(format!(
            "no acknowledgment in response: {}",
            excerpt(body)
        )))
    }
}

/// First 120 characters of a body, whitespace collapsed.
fn excerpt(body: &str) -> String {
    let flat: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(120) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}
