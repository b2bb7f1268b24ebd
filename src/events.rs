//! Notifications published by the kill switch.
//!
//! Every event is logged through `tracing` and broadcast to subscribers
//! (the status file writer, tests). A lagging or absent subscriber never
//! blocks the poll cycle.
use crate::verdict::ConnectivityVerdict;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KillSwitchEvent {
    Armed,
    Disarmed,
    /// Next poll is due in `delay_ms`.
    PollScheduled { delay_ms: u64 },
    /// A cycle finished with connectivity present.
    ConnectivityOk { verdict: ConnectivityVerdict },
    ShutdownTriggered {
        reason: String,
        verdict: ConnectivityVerdict,
    },
    ShutdownSuppressed {
        reason: String,
        guards: Vec<String>,
        verdict: ConnectivityVerdict,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KillSwitchEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KillSwitchEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: KillSwitchEvent) {
        match &event {
            KillSwitchEvent::Armed => tracing::info!("kill switch armed"),
            KillSwitchEvent::Disarmed => tracing::info!("kill switch disarmed"),
            KillSwitchEvent::PollScheduled { delay_ms } => {
                tracing::debug!(delay_ms, "next connectivity check scheduled")
            }
            KillSwitchEvent::ConnectivityOk { verdict } => tracing::debug!(
                dns_reachable = verdict.dns_reachable,
                web_reachable = verdict.web_reachable,
                "connectivity present"
            ),
            KillSwitchEvent::ShutdownTriggered { reason, .. } => {
                tracing::warn!(%reason, "triggering shutdown")
            }
            KillSwitchEvent::ShutdownSuppressed { reason, guards, .. } => tracing::warn!(
                %reason,
                guards = ?guards,
                "connectivity lost but guards are active, shutdown delayed"
            ),
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
