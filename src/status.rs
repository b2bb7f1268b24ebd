/// Status file: writes the kill switch state as JSON on every event.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::events::KillSwitchEvent;
use crate::guard::GuardSet;
use crate::verdict::ConnectivityVerdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// States written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    Disarmed,
    Armed,
    ShutdownIssued,
}

/// Outcome of the most recent poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LastOutcome {
    ConnectivityOk,
    ShutdownSuppressed { reason: String, guards: Vec<String> },
    ShutdownTriggered { reason: String },
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: SwitchState,
    pub last_verdict: Option<ConnectivityVerdict>,
    pub last_outcome: Option<LastOutcome>,
    pub next_poll_ms: Option<u64>,
    pub active_guards: Vec<String>,
    pub cycles: u64,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".killswitch.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Read and parse the status file.
    pub fn read(&self) -> Result<StatusData, StatusError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| StatusError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        serde_json::from_str(&contents).map_err(|e| StatusError::Parse { source: e })
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Folds kill switch events into [`StatusData`] and writes each update.
pub struct StatusTracker {
    file: StatusFile,
    guards: GuardSet,
    pid: u32,
    state: SwitchState,
    last_verdict: Option<ConnectivityVerdict>,
    last_outcome: Option<LastOutcome>,
    next_poll_ms: Option<u64>,
    cycles: u64,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf, guards: GuardSet) -> Self {
        Self {
            file: StatusFile::new(status_path),
            guards,
            pid: std::process::id(),
            state: SwitchState::Disarmed,
            last_verdict: None,
            last_outcome: None,
            next_poll_ms: None,
            cycles: 0,
        }
    }

    pub fn apply(&mut self, event: &KillSwitchEvent) {
        match event {
            KillSwitchEvent::Armed => self.state = SwitchState::Armed,
            KillSwitchEvent::Disarmed => {
                self.state = SwitchState::Disarmed;
                self.next_poll_ms = None;
            }
            KillSwitchEvent::PollScheduled { delay_ms } => self.next_poll_ms = Some(*delay_ms),
            KillSwitchEvent::ConnectivityOk { verdict } => {
                self.cycles += 1;
                self.last_verdict = Some(*verdict);
                self.last_outcome = Some(LastOutcome::ConnectivityOk);
            }
            KillSwitchEvent::ShutdownSuppressed {
                reason,
                guards,
                verdict,
            } => {
                self.cycles += 1;
                self.last_verdict = Some(*verdict);
                self.last_outcome = Some(LastOutcome::ShutdownSuppressed {
                    reason: reason.clone(),
                    guards: guards.clone(),
                });
            }
            KillSwitchEvent::ShutdownTriggered { reason, verdict } => {
                self.cycles += 1;
                self.last_verdict = Some(*verdict);
                self.state = SwitchState::ShutdownIssued;
                self.next_poll_ms = None;
                self.last_outcome = Some(LastOutcome::ShutdownTriggered {
                    reason: reason.clone(),
                });
            }
        }
    }

    pub fn snapshot(&self) -> StatusData {
        StatusData {
            pid: self.pid,
            state: self.state,
            last_verdict: self.last_verdict,
            last_outcome: self.last_outcome.clone(),
            next_poll_ms: self.next_poll_ms,
            active_guards: self.guards.snapshot().active(),
            cycles: self.cycles,
            last_update: Utc::now(),
        }
    }

    /// Write the current state.
    pub fn update(&self) {
        if let Err(e) = self.file.write(&self.snapshot()) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}

/// Keep the status file current until the event channel closes.
pub fn spawn_writer(
    mut tracker: StatusTracker,
    mut rx: broadcast::Receiver<KillSwitchEvent>,
) -> JoinHandle<StatusTracker> {
    tokio::spawn(async move {
        tracker.update();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    tracker.apply(&event);
                    tracker.update();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status writer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracker
    })
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        source: serde_json::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Parse { source } => write!(f, "malformed status file: {source}"),
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Parse { source } => Some(source),
        }
    }
}
