//! Endpoint failover for chain clients
//!
//! Clients take a comma-separated list of endpoint URLs, primary first. After
//! `threshold` consecutive transport failures the active endpoint advances to
//! the next one (wrapping around). Swap state never depends on which node
//! answered, so switching loses nothing.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use eyre::{eyre, Result};
use tracing::warn;

/// Parse a comma-separated endpoint string into individual trimmed URLs.
pub fn parse_endpoint_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reject anything that isn't an http(s) URL with a host
pub fn validate_endpoint_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| eyre!("Invalid endpoint URL {}: {}", raw, e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(eyre!("Endpoint URL {} has unsupported scheme {}", raw, other)),
    }
    if parsed.host_str().is_none() {
        return Err(eyre!("Endpoint URL {} has no host", raw));
    }
    Ok(())
}

#[derive(Debug)]
pub struct EndpointSet {
    label: &'static str,
    urls: Vec<String>,
    active: AtomicUsize,
    consecutive_failures: AtomicU32,
    threshold: u32,
    switches: AtomicU64,
}

impl EndpointSet {
    pub fn new(label: &'static str, urls: Vec<String>, threshold: u32) -> Result<Self> {
        if urls.is_empty() {
            return Err(eyre!("At least one {} endpoint is required", label));
        }
        for url in &urls {
            validate_endpoint_url(url)?;
        }
        Ok(Self {
            label,
            urls,
            active: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            switches: AtomicU64::new(0),
        })
    }

    pub fn current(&self) -> &str {
        &self.urls[self.active.load(Ordering::Acquire) % self.urls.len()]
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Number of times the active endpoint changed
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Record a transport failure. Returns true if the active endpoint changed.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.threshold || self.urls.len() < 2 {
            return false;
        }
        self.consecutive_failures.store(0, Ordering::Release);
        let previous = self.active.fetch_add(1, Ordering::AcqRel) % self.urls.len();
        self.switches.fetch_add(1, Ordering::Relaxed);
        warn!(
            chain = self.label,
            from = %self.urls[previous],
            to = %self.current(),
            "Endpoint failing, switching to backup"
        );
        true
    }
}
