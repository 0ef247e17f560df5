//! Loopback HTTP liveness probes.
//!
//! A probe is a single GET with a hard timeout. Any completed response counts
//! as reachable, whatever its status; anything else becomes a failure reason.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1";

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server answered with this HTTP status code.
    Status(u16),
    /// The request could not complete.
    Failure(String),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Status(_))
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Status(code) => write!(f, "{}", code),
            ProbeOutcome::Failure(reason) => write!(f, "Error: {}", reason),
        }
    }
}

/// Outcome of probing one service during a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub id: usize,
    pub name: String,
    pub port: u16,
    pub outcome: ProbeOutcome,
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Port {}) - Status: {}",
            self.name, self.port, self.outcome
        )
    }
}

/// Builds the probe target for a port: `<base>:<port>`, no path.
pub fn service_url(base_url: &str, port: u16) -> String {
    format!("{}:{}", base_url.trim_end_matches('/'), port)
}

/// HTTP client used for health checks and shutdown notifications.
#[derive(Debug, Clone)]
pub struct ServiceProbe {
    client: reqwest::Client,
}

impl ServiceProbe {
    pub fn new() -> Result<Self> {
        // Loopback only: self-signed certificates are fine, proxies are not.
        let client = reqwest::Client::builder()
            .user_agent(format!("devrack/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Issues one GET to `url`, giving up after `timeout`.
    pub async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let request = self.client.get(url).timeout(timeout).send();
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => ProbeOutcome::Status(response.status().as_u16()),
            Ok(Err(err)) => ProbeOutcome::Failure(describe_error(&err)),
            Err(_) => ProbeOutcome::Failure(format!("timed out after {:?}", timeout)),
        }
    }
}

// reqwest's top-level message hides the interesting part ("Connection refused")
// in its source chain, so flatten the chain into one line.
fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
