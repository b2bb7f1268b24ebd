/// Reachability probing: one bounded-time TCP connect per call.
///
/// Every failure mode (timeout, refusal, resolver error, anything else the
/// socket layer reports) collapses to `false`. The connection is dropped as
/// soon as it completes, so nothing outlives the call.
use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

/// A (host, port) pair to probe. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeTarget {
    host: String,
    port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 literal.
    ///
    /// `default_port` applies when the input names no port.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, TargetParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TargetParseError::Empty);
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| TargetParseError::Malformed(input.to_string()))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(TargetParseError::Malformed(input.to_string())),
                },
            }
        } else {
            match input.matches(':').count() {
                0 => (input, None),
                1 => {
                    let (host, port) = input.split_once(':').unwrap_or((input, ""));
                    (host, Some(port))
                }
                // Unbracketed IPv6 literal: no room for a port.
                _ => (input, None),
            }
        };

        if host.is_empty() {
            return Err(TargetParseError::MissingHost(input.to_string()));
        }

        let port = match port {
            None => default_port,
            Some(raw) => match raw.parse::<u16>() {
                Ok(0) | Err(_) => return Err(TargetParseError::InvalidPort(raw.to_string())),
                Ok(p) => p,
            },
        };

        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Errors from parsing a probe target string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetParseError {
    Empty,
    MissingHost(String),
    InvalidPort(String),
    Malformed(String),
}

impl std::fmt::Display for TargetParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetParseError::Empty => write!(f, "probe target is empty"),
            TargetParseError::MissingHost(input) => write!(f, "probe target {input:?} has no host"),
            TargetParseError::InvalidPort(port) => write!(f, "invalid probe port {port:?}"),
            TargetParseError::Malformed(input) => write!(f, "malformed probe target {input:?}"),
        }
    }
}

impl std::error::Error for TargetParseError {}

/// Performs a single connection attempt against a target.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns true iff a connection completes within `timeout`. No retries.
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> bool;
}

/// Prober backed by a plain TCP connect. Name resolution counts against the timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> bool {
        let attempt = TcpStream::connect((target.host(), target.port()));
        bounded_attempt(target, timeout, attempt).await
    }
}

/// Await one connection attempt for at most `timeout`, folding every outcome
/// into a bool. The connection, if any, is dropped before returning.
async fn bounded_attempt<F, T>(target: &ProbeTarget, timeout: Duration, attempt: F) -> bool
where
    F: Future<Output = std::io::Result<T>>,
{
    let start = Instant::now();
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(conn)) => {
            drop(conn);
            tracing::debug!(
                %target,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "probe connected"
            );
            true
        }
        Ok(Err(e)) => {
            tracing::debug!(%target, error = %e, "probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(%target, timeout_ms = timeout.as_millis() as u64, "probe timed out");
            false
        }
    }
}
