/// Shutdown actions: what actually happens when the kill switch fires.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// One shutdown request, handed to the action exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownEvent {
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl ShutdownEvent {
    pub fn now(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Fire-and-forget shutdown hook. On success the host is expected to go
/// down, so callers must not depend on `invoke` returning.
pub trait ShutdownAction: Send + Sync {
    fn invoke(&self, event: &ShutdownEvent);
}

/// Spawns an external command (by default `shutdown -h now`), detached in
/// its own process group.
#[derive(Debug, Clone)]
pub struct CommandShutdown {
    command: String,
    args: Vec<String>,
}

impl CommandShutdown {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl ShutdownAction for CommandShutdown {
    fn invoke(&self, event: &ShutdownEvent) {
        tracing::info!(
            reason = %event.reason,
            command = %self.command,
            args = ?self.args,
            "invoking shutdown command"
        );

        let spawned = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn();

        match spawned {
            Ok(child) => tracing::info!(pid = child.id(), "shutdown command started"),
            Err(e) => tracing::error!(
                error = %e,
                command = %self.command,
                "failed to spawn shutdown command"
            ),
        }
    }
}

/// Logs the event and does nothing else. For dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyShutdown;

impl ShutdownAction for LogOnlyShutdown {
    fn invoke(&self, event: &ShutdownEvent) {
        tracing::warn!(reason = %event.reason, at = %event.at, "shutdown suppressed by log-only mode");
    }
}
