use crate::jitter::{IntervalBounds, DEFAULT_INTERVAL_HIGH_MS, DEFAULT_INTERVAL_LOW_MS};
use crate::link::EnumerationErrorPolicy;
use crate::probe::{ProbeTarget, TargetParseError, DEFAULT_PROBE_TIMEOUT_MS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "killswitch.toml";
pub const DNS_PORT: u16 = 53;
pub const WEB_PORT: u16 = 80;
/// Floor for `guards.sync_interval_ms`.
pub const MIN_GUARD_SYNC_MS: u64 = 100;

/// Top-level configuration loaded from killswitch.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct KillSwitchConfig {
    pub probe: ProbeConfig,
    pub poll: PollConfig,
    pub link: LinkConfig,
    pub guards: GuardsConfig,
    pub shutdown: ShutdownConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// `host` or `host:port`; bare hosts get port 53.
    pub dns_targets: Vec<String>,
    /// `host` or `host:port`; bare hosts get port 80.
    pub web_targets: Vec<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_low_ms: u64,
    pub interval_high_ms: u64,
    /// Fixed seed for interval jitter and target selection.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct LinkConfig {
    pub on_enumeration_error: EnumerationErrorPolicy,
    pub ignore_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardsConfig {
    pub dir: PathBuf,
    /// Guards registered (inactive) at startup so they show up in status.
    pub names: Vec<String>,
    /// Background refresh of the guard directory for the status file. Poll
    /// cycles also re-read the directory before deciding.
    pub sync_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Log the shutdown instead of running the command.
    pub log_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub file: PathBuf,
}

impl KillSwitchConfig {
    /// Load from `path`. A missing file at the default location yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    && path == Path::new(DEFAULT_CONFIG_PATH) =>
            {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: None,
            source: e,
        })
    }

    /// Check everything the kill switch needs before it may be armed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.probe.dns_pool()?;
        self.probe.web_pool()?;
        self.probe.timeout()?;
        self.poll.bounds()?;
        for name in &self.guards.names {
            if !crate::guard::is_valid_guard_name(name) {
                return Err(ConfigError::InvalidGuardName(name.clone()));
            }
        }
        if self.guards.sync_interval_ms < MIN_GUARD_SYNC_MS {
            return Err(ConfigError::GuardSyncInterval(self.guards.sync_interval_ms));
        }
        if self.shutdown.command.trim().is_empty() && !self.shutdown.log_only {
            return Err(ConfigError::EmptyShutdownCommand);
        }
        Ok(())
    }
}

fn parse_pool(
    pool: &'static str,
    entries: &[String],
    default_port: u16,
) -> Result<Vec<ProbeTarget>, ConfigError> {
    if entries.is_empty() {
        return Err(ConfigError::EmptyPool { pool });
    }
    entries
        .iter()
        .map(|input| {
            ProbeTarget::parse(input, default_port).map_err(|e| ConfigError::InvalidTarget {
                pool,
                source: e,
            })
        })
        .collect()
}

impl ProbeConfig {
    pub fn dns_pool(&self) -> Result<Vec<ProbeTarget>, ConfigError> {
        parse_pool("dns", &self.dns_targets, DNS_PORT)
    }

    pub fn web_pool(&self) -> Result<Vec<ProbeTarget>, ConfigError> {
        parse_pool("web", &self.web_targets, WEB_PORT)
    }

    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(Duration::from_millis(self.timeout_ms))
    }
}

impl PollConfig {
    pub fn bounds(&self) -> Result<IntervalBounds, ConfigError> {
        IntervalBounds::new(self.interval_low_ms, self.interval_high_ms).ok_or(
            ConfigError::IntervalBounds {
                low_ms: self.interval_low_ms,
                high_ms: self.interval_high_ms,
            },
        )
    }
}

// --- Default implementations ---

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            dns_targets: vec![
                "8.8.8.8".to_string(),
                "1.1.1.1".to_string(),
                "208.67.222.222".to_string(),
            ],
            web_targets: vec![
                "www.google.com".to_string(),
                "www.amazon.com".to_string(),
                "www.wikipedia.org".to_string(),
            ],
            timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_low_ms: DEFAULT_INTERVAL_LOW_MS,
            interval_high_ms: DEFAULT_INTERVAL_HIGH_MS,
            seed: None,
        }
    }
}

impl Default for GuardsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/killswitch/guards"),
            names: vec![
                crate::guard::FILE_OPERATION.to_string(),
                crate::guard::SYSTEM_UPGRADE.to_string(),
            ],
            sync_interval_ms: 1000,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            command: "shutdown".to_string(),
            args: vec!["-h".to_string(), "now".to_string()],
            log_only: false,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/run/killswitch/status.json"),
        }
    }
}

/// Errors from loading or validating configuration. All are fatal: the
/// switch cannot be armed with a bad config.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    EmptyPool {
        pool: &'static str,
    },
    InvalidTarget {
        pool: &'static str,
        source: TargetParseError,
    },
    ZeroTimeout,
    IntervalBounds {
        low_ms: u64,
        high_ms: u64,
    },
    InvalidGuardName(String),
    GuardSyncInterval(u64),
    EmptyShutdownCommand,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse {
                path: Some(path),
                source,
            } => write!(f, "failed to parse config {}: {source}", path.display()),
            ConfigError::Parse { path: None, source } => {
                write!(f, "failed to parse config: {source}")
            }
            ConfigError::EmptyPool { pool } => {
                write!(f, "probe.{pool}_targets must name at least one target")
            }
            ConfigError::InvalidTarget { pool, source } => {
                write!(f, "invalid entry in probe.{pool}_targets: {source}")
            }
            ConfigError::ZeroTimeout => write!(f, "probe.timeout_ms must be greater than zero"),
            ConfigError::IntervalBounds { low_ms, high_ms } => write!(
                f,
                "poll.interval_low_ms ({low_ms}) must be below poll.interval_high_ms ({high_ms})"
            ),
            ConfigError::InvalidGuardName(name) => write!(f, "invalid guard name {name:?}"),
            ConfigError::GuardSyncInterval(ms) => write!(
                f,
                "guards.sync_interval_ms ({ms}) must be at least {MIN_GUARD_SYNC_MS}"
            ),
            ConfigError::EmptyShutdownCommand => write!(f, "shutdown.command is empty"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidTarget { source, .. } => Some(source),
            _ => None,
        }
    }
}
