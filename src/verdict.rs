/// Connectivity verdict: local link plus one DNS-port and one web-port probe.
use crate::jitter::Jitter;
use crate::link::LinkDetector;
use crate::probe::{ProbeTarget, Prober};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REASON_LINK_DOWN: &str = "Local network unavailable";
pub const REASON_UNREACHABLE: &str = "Connectivity lost: DNS and website unreachable";

/// Per-cycle observation. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityVerdict {
    pub local_link_up: bool,
    pub dns_reachable: bool,
    pub web_reachable: bool,
}

impl ConnectivityVerdict {
    /// Verdict for a cycle cut short by a missing local link.
    pub fn link_down() -> Self {
        Self {
            local_link_up: false,
            dns_reachable: false,
            web_reachable: false,
        }
    }

    /// No link at all, or both remote channels dead. One working channel is enough.
    pub fn is_lost(&self) -> bool {
        !self.local_link_up || (!self.dns_reachable && !self.web_reachable)
    }

    /// Shutdown reason for a lost verdict.
    pub fn loss_reason(&self) -> Option<&'static str> {
        if !self.local_link_up {
            Some(REASON_LINK_DOWN)
        } else if self.is_lost() {
            Some(REASON_UNREACHABLE)
        } else {
            None
        }
    }
}

pub struct VerdictEngine {
    link: Arc<dyn LinkDetector>,
    prober: Arc<dyn Prober>,
    dns_pool: Vec<ProbeTarget>,
    web_pool: Vec<ProbeTarget>,
    timeout: Duration,
    jitter: Mutex<Jitter>,
}

impl VerdictEngine {
    /// Fails fast on an empty pool or a zero timeout.
    pub fn new(
        link: Arc<dyn LinkDetector>,
        prober: Arc<dyn Prober>,
        dns_pool: Vec<ProbeTarget>,
        web_pool: Vec<ProbeTarget>,
        timeout: Duration,
        jitter: Jitter,
    ) -> Result<Self, EngineError> {
        if dns_pool.is_empty() {
            return Err(EngineError::EmptyPool { pool: "dns" });
        }
        if web_pool.is_empty() {
            return Err(EngineError::EmptyPool { pool: "web" });
        }
        if timeout.is_zero() {
            return Err(EngineError::ZeroTimeout);
        }
        Ok(Self {
            link,
            prober,
            dns_pool,
            web_pool,
            timeout,
            jitter: Mutex::new(jitter),
        })
    }

    fn pick_targets(&self) -> Result<(ProbeTarget, ProbeTarget), EngineError> {
        let mut jitter = self.jitter.lock().unwrap_or_else(|e| e.into_inner());
        let dns = jitter
            .pick(&self.dns_pool)
            .cloned()
            .ok_or(EngineError::EmptyPool { pool: "dns" })?;
        let web = jitter
            .pick(&self.web_pool)
            .cloned()
            .ok_or(EngineError::EmptyPool { pool: "web" })?;
        Ok((dns, web))
    }

    /// Run one check. Remote probes are skipped when there is no local link.
    pub async fn evaluate(&self) -> ConnectivityVerdict {
        if !self.link.has_active_local_link() {
            return ConnectivityVerdict::link_down();
        }

        // Pools are non-empty by construction.
        let (dns, web) = match self.pick_targets() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "no probe target available");
                return ConnectivityVerdict {
                    local_link_up: true,
                    dns_reachable: false,
                    web_reachable: false,
                };
            }
        };

        let (dns_reachable, web_reachable) = tokio::join!(
            self.prober.probe(&dns, self.timeout),
            self.prober.probe(&web, self.timeout),
        );

        tracing::debug!(
            dns = %dns,
            dns_reachable,
            web = %web,
            web_reachable,
            "probes complete"
        );

        ConnectivityVerdict {
            local_link_up: true,
            dns_reachable,
            web_reachable,
        }
    }
}

/// Construction-time configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    EmptyPool { pool: &'static str },
    ZeroTimeout,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::EmptyPool { pool } => write!(f, "{pool} probe pool is empty"),
            EngineError::ZeroTimeout => write!(f, "probe timeout must be greater than zero"),
        }
    }
}

impl std::error::Error for EngineError {}
