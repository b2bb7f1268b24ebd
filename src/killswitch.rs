/// Kill switch state machine: arming, jittered polling, and the shutdown decision.
///
/// While armed, a single Tokio task sleeps for a random interval, runs one
/// connectivity check, acts on it, and draws the next interval. Cycles never
/// overlap. Disarming aborts the task without waiting for it; a check that
/// still manages to finish sees a stale epoch and drops its verdict.
use crate::events::{EventBus, KillSwitchEvent};
use crate::guard::{is_shutdown_permitted, GuardSet};
use crate::guard_dir::GuardDirSync;
use crate::jitter::{IntervalBounds, Jitter};
use crate::shutdown::{ShutdownAction, ShutdownEvent};
use crate::verdict::{ConnectivityVerdict, VerdictEngine};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Disarmed,
    Armed,
}

/// What a single poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Disarmed before or during the cycle; nothing was done.
    Discarded,
    Healthy(ConnectivityVerdict),
    Suppressed {
        verdict: ConnectivityVerdict,
        guards: Vec<String>,
    },
    ShutdownInvoked(ShutdownEvent),
}

struct Control {
    state: ArmState,
    /// Bumped on every transition; a poll task only acts for its own epoch.
    epoch: u64,
    poller: Option<JoinHandle<()>>,
}

struct Inner {
    engine: VerdictEngine,
    guards: GuardSet,
    /// Guard files folded into `guards` before every decision.
    guard_dir: Mutex<Option<GuardDirSync>>,
    shutdown: Arc<dyn ShutdownAction>,
    bounds: IntervalBounds,
    jitter: Mutex<Jitter>,
    control: Mutex<Control>,
    events: EventBus,
}

/// Cheap to clone; all clones drive the same switch.
#[derive(Clone)]
pub struct KillSwitch {
    inner: Arc<Inner>,
}

impl KillSwitch {
    /// Starts disarmed.
    pub fn new(
        engine: VerdictEngine,
        guards: GuardSet,
        shutdown: Arc<dyn ShutdownAction>,
        bounds: IntervalBounds,
        jitter: Jitter,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                guards,
                guard_dir: Mutex::new(None),
                shutdown,
                bounds,
                jitter: Mutex::new(jitter),
                control: Mutex::new(Control {
                    state: ArmState::Disarmed,
                    epoch: 0,
                    poller: None,
                }),
                events: EventBus::new(),
            }),
        }
    }

    pub fn state(&self) -> ArmState {
        self.inner.lock_control().state
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Read guard files from `sync` before each shutdown decision.
    pub fn attach_guard_dir(&self, sync: GuardDirSync) {
        *self.inner.guard_dir.lock().unwrap_or_else(|e| e.into_inner()) = Some(sync);
    }

    /// Fold the attached guard directory into the guard set now.
    pub fn refresh_guards(&self) {
        self.inner.refresh_guards();
    }

    /// Operator toggle.
    pub fn set_armed(&self, armed: bool) {
        if armed {
            self.arm();
        } else {
            self.disarm();
        }
    }

    /// Start polling. A no-op while already armed. Must be called from
    /// within a Tokio runtime.
    pub fn arm(&self) {
        let mut control = self.inner.lock_control();
        if control.state == ArmState::Armed {
            tracing::debug!("already armed");
            return;
        }
        control.state = ArmState::Armed;
        control.epoch += 1;
        let epoch = control.epoch;
        control.poller = Some(tokio::spawn(poll_loop(self.inner.clone(), epoch)));
        drop(control);

        self.inner.events.emit(KillSwitchEvent::Armed);
    }

    /// Stop polling. Cancels the pending poll and does not wait for one in flight.
    pub fn disarm(&self) {
        let mut control = self.inner.lock_control();
        if control.state == ArmState::Disarmed {
            return;
        }
        control.state = ArmState::Disarmed;
        control.epoch += 1;
        if let Some(poller) = control.poller.take() {
            poller.abort();
        }
        drop(control);

        self.inner.events.emit(KillSwitchEvent::Disarmed);
    }
}

impl Inner {
    fn lock_control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_guards(&self) {
        let mut guard_dir = self.guard_dir.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sync) = guard_dir.as_mut() {
            if let Err(e) = sync.sync(&self.guards) {
                tracing::warn!(error = %e, "guard directory sync failed");
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        let control = self.lock_control();
        control.state == ArmState::Armed && control.epoch == epoch
    }

    fn next_interval(&self) -> std::time::Duration {
        self.jitter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .interval(&self.bounds)
    }

    /// One poll cycle on behalf of `epoch`.
    async fn run_cycle(&self, epoch: u64) -> CycleOutcome {
        if !self.is_current(epoch) {
            return CycleOutcome::Discarded;
        }

        let verdict = self.engine.evaluate().await;

        if !self.is_current(epoch) {
            tracing::debug!(?verdict, "disarmed during check, discarding verdict");
            return CycleOutcome::Discarded;
        }

        let Some(reason) = verdict.loss_reason() else {
            self.events.emit(KillSwitchEvent::ConnectivityOk { verdict });
            return CycleOutcome::Healthy(verdict);
        };

        self.refresh_guards();
        let snapshot = self.guards.snapshot();
        if !is_shutdown_permitted(&snapshot) {
            let guards = snapshot.active();
            self.events.emit(KillSwitchEvent::ShutdownSuppressed {
                reason: reason.to_string(),
                guards: guards.clone(),
                verdict,
            });
            return CycleOutcome::Suppressed { verdict, guards };
        }

        // Commit under the lock so a racing disarm either wins outright or
        // sees the switch already spent.
        {
            let mut control = self.lock_control();
            if control.state != ArmState::Armed || control.epoch != epoch {
                return CycleOutcome::Discarded;
            }
            control.state = ArmState::Disarmed;
            control.epoch += 1;
            // Detach our own handle; aborting it here would cancel this cycle.
            control.poller.take();
        }

        let event = ShutdownEvent::now(reason);
        self.events.emit(KillSwitchEvent::ShutdownTriggered {
            reason: event.reason.clone(),
            verdict,
        });
        self.shutdown.invoke(&event);
        CycleOutcome::ShutdownInvoked(event)
    }
}

async fn poll_loop(inner: Arc<Inner>, epoch: u64) {
    loop {
        let delay = inner.next_interval();
        inner.events.emit(KillSwitchEvent::PollScheduled {
            delay_ms: delay.as_millis() as u64,
        });
        tokio::time::sleep(delay).await;

        match inner.run_cycle(epoch).await {
            CycleOutcome::Healthy(verdict) => tracing::trace!(?verdict, "cycle complete"),
            CycleOutcome::Suppressed { verdict, guards } => {
                tracing::debug!(?verdict, ?guards, "cycle complete, shutdown vetoed")
            }
            CycleOutcome::Discarded => break,
            CycleOutcome::ShutdownInvoked(event) => {
                tracing::info!(reason = %event.reason, at = %event.at, "poll loop stopped after shutdown");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::FILE_OPERATION;
    use crate::guard_dir::GuardDir;
    use crate::shutdown::testing::RecordingShutdown;
    use crate::verdict::testing::{engine, StaticLink, StubProber};
    use crate::verdict::{REASON_LINK_DOWN, REASON_UNREACHABLE};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Rig {
        ks: KillSwitch,
        link: Arc<StaticLink>,
        prober: Arc<StubProber>,
        shutdown: Arc<RecordingShutdown>,
        rx: broadcast::Receiver<KillSwitchEvent>,
    }

    fn rig_with(link_up: bool, prober: Arc<StubProber>, guards: GuardSet) -> Rig {
        let link = StaticLink::new(link_up);
        let shutdown = Arc::new(RecordingShutdown::default());
        let ks = KillSwitch::new(
            engine(link.clone(), prober.clone()),
            guards,
            shutdown.clone(),
            IntervalBounds::default(),
            Jitter::seeded(Some(42)),
        );
        let rx = ks.events().subscribe();
        Rig {
            ks,
            link,
            prober,
            shutdown,
            rx,
        }
    }

    fn rig(link_up: bool, dns_ok: bool, web_ok: bool) -> Rig {
        rig_with(link_up, StubProber::new(dns_ok, web_ok), GuardSet::default())
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<KillSwitchEvent>, pred: F) -> KillSwitchEvent
    where
        F: Fn(&KillSwitchEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    fn unreachable() -> ConnectivityVerdict {
        ConnectivityVerdict {
            local_link_up: true,
            dns_reachable: false,
            web_reachable: false,
        }
    }

    fn is_cycle_end(e: &KillSwitchEvent) -> bool {
        matches!(
            e,
            KillSwitchEvent::ConnectivityOk { .. }
                | KillSwitchEvent::ShutdownSuppressed { .. }
                | KillSwitchEvent::ShutdownTriggered { .. }
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_disarmed() {
        let r = rig(true, true, true);
        assert_eq!(r.ks.state(), ArmState::Disarmed);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(r.prober.calls(), 0);
        assert_eq!(r.link.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_triggers_exactly_one_shutdown() {
        let mut r = rig(true, false, false);
        r.ks.arm();

        let event = next_matching(&mut r.rx, is_cycle_end).await;
        assert_eq!(
            event,
            KillSwitchEvent::ShutdownTriggered {
                reason: REASON_UNREACHABLE.to_string(),
                verdict: unreachable(),
            }
        );
        assert_eq!(r.shutdown.reasons(), vec![REASON_UNREACHABLE]);
        assert_eq!(r.prober.calls(), 2);

        // Spent: disarmed, no further polling.
        assert_eq!(r.ks.state(), ArmState::Disarmed);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(r.shutdown.reasons().len(), 1);
        assert_eq!(r.prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fires_within_first_interval() {
        let mut r = rig(true, false, false);
        let start = tokio::time::Instant::now();
        r.ks.arm();
        next_matching(&mut r.rx, is_cycle_end).await;
        assert!(start.elapsed() < Duration::from_millis(10_000));
        assert!(start.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_suppresses_shutdown() {
        let guards = GuardSet::default();
        guards.activate(FILE_OPERATION);
        let mut r = rig_with(true, StubProber::new(false, false), guards);
        r.ks.arm();

        let event = next_matching(&mut r.rx, is_cycle_end).await;
        assert_eq!(
            event,
            KillSwitchEvent::ShutdownSuppressed {
                reason: REASON_UNREACHABLE.to_string(),
                guards: vec![FILE_OPERATION.to_string()],
                verdict: unreachable(),
            }
        );
        assert!(r.shutdown.reasons().is_empty());
        // The veto does not disarm.
        assert_eq!(r.ks.state(), ArmState::Armed);
        r.ks.disarm();
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_veto_holds_across_many_cycles() {
        let guards = GuardSet::default();
        guards.activate("system-upgrade");
        let mut r = rig_with(false, StubProber::new(false, false), guards);
        r.ks.arm();

        for _ in 0..10 {
            let event = next_matching(&mut r.rx, is_cycle_end).await;
            assert!(matches!(event, KillSwitchEvent::ShutdownSuppressed { .. }));
        }
        assert!(r.shutdown.reasons().is_empty());
        r.ks.disarm();
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_guard_no_longer_blocks() {
        let guards = GuardSet::default();
        guards.activate(FILE_OPERATION);
        let mut r = rig_with(true, StubProber::new(false, false), guards.clone());
        r.ks.arm();

        let first = next_matching(&mut r.rx, is_cycle_end).await;
        assert!(matches!(first, KillSwitchEvent::ShutdownSuppressed { .. }));

        guards.release(FILE_OPERATION);
        let second = next_matching(&mut r.rx, is_cycle_end).await;
        assert!(matches!(second, KillSwitchEvent::ShutdownTriggered { .. }));
        assert_eq!(r.shutdown.reasons(), vec![REASON_UNREACHABLE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_file_vetoes_next_cycle_without_tick() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = GuardDir::new(tmp.path());
        let mut r = rig(true, false, false);
        r.ks.attach_guard_dir(GuardDirSync::new(dir.clone()));
        r.ks.arm();

        // Written after arming; nothing else reads the directory.
        dir.activate(FILE_OPERATION).unwrap();
        let event = next_matching(&mut r.rx, is_cycle_end).await;
        match event {
            KillSwitchEvent::ShutdownSuppressed { guards, .. } => {
                assert_eq!(guards, vec![FILE_OPERATION.to_string()])
            }
            other => panic!("expected suppression, got {other:?}"),
        }
        assert!(r.shutdown.reasons().is_empty());

        dir.release(FILE_OPERATION).unwrap();
        let event = next_matching(&mut r.rx, is_cycle_end).await;
        assert!(matches!(event, KillSwitchEvent::ShutdownTriggered { .. }));
        assert_eq!(r.shutdown.reasons(), vec![REASON_UNREACHABLE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_shuts_down_without_probes() {
        let mut r = rig(false, true, true);
        r.ks.arm();

        let event = next_matching(&mut r.rx, is_cycle_end).await;
        assert_eq!(
            event,
            KillSwitchEvent::ShutdownTriggered {
                reason: REASON_LINK_DOWN.to_string(),
                verdict: ConnectivityVerdict::link_down(),
            }
        );
        assert_eq!(r.shutdown.reasons(), vec![REASON_LINK_DOWN]);
        assert_eq!(r.prober.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_cycles_keep_polling() {
        let mut r = rig(true, false, true);
        r.ks.arm();

        for _ in 0..5 {
            let event = next_matching(&mut r.rx, is_cycle_end).await;
            assert!(matches!(event, KillSwitchEvent::ConnectivityOk { .. }));
        }
        assert!(r.shutdown.reasons().is_empty());
        assert_eq!(r.prober.calls(), 10);
        r.ks.disarm();
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_interval_within_bounds() {
        let mut r = rig(true, true, true);
        r.ks.arm();

        let bounds = IntervalBounds::default();
        for _ in 0..50 {
            if let KillSwitchEvent::PollScheduled { delay_ms } = next_matching(&mut r.rx, |e| {
                matches!(e, KillSwitchEvent::PollScheduled { .. })
            })
            .await
            {
                assert!(bounds.contains(delay_ms), "delay {delay_ms} out of bounds");
            }
        }
        r.ks.disarm();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_redrawn_after_verdict() {
        let mut r = rig(true, true, true);
        r.ks.arm();

        let mut order = Vec::new();
        while order.len() < 6 {
            match r.rx.recv().await.unwrap() {
                KillSwitchEvent::PollScheduled { .. } => order.push("scheduled"),
                KillSwitchEvent::ConnectivityOk { .. } => order.push("verdict"),
                _ => {}
            }
        }
        assert_eq!(
            order,
            vec!["scheduled", "verdict", "scheduled", "verdict", "scheduled", "verdict"]
        );
        r.ks.disarm();
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_arm_keeps_single_schedule() {
        let mut r = rig(true, true, true);
        r.ks.arm();
        r.ks.arm();

        let mut armed = 0;
        let mut scheduled = 0;
        loop {
            match r.rx.recv().await.unwrap() {
                KillSwitchEvent::Armed => armed += 1,
                KillSwitchEvent::PollScheduled { .. } => scheduled += 1,
                KillSwitchEvent::ConnectivityOk { .. } => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(armed, 1);
        assert_eq!(scheduled, 1);
        assert_eq!(r.prober.calls(), 2);
        assert_eq!(r.link.calls.load(Ordering::SeqCst), 1);
        r.ks.disarm();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_pending_poll() {
        let r = rig(false, false, false);
        r.ks.arm();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        r.ks.disarm();
        assert_eq!(r.ks.state(), ArmState::Disarmed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(r.link.calls.load(Ordering::SeqCst), 0);
        assert!(r.shutdown.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_twice_emits_once() {
        let mut r = rig(true, true, true);
        r.ks.arm();
        r.ks.disarm();
        r.ks.disarm();

        assert_eq!(r.rx.recv().await.unwrap(), KillSwitchEvent::Armed);
        let mut disarms = 0;
        while let Ok(event) = r.rx.try_recv() {
            if event == KillSwitchEvent::Disarmed {
                disarms += 1;
            }
        }
        assert_eq!(disarms, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_poll_aborted_by_disarm() {
        let prober = StubProber::gated(false, false);
        let r = rig_with(true, prober.clone(), GuardSet::default());
        r.ks.arm();

        // Wait until the cycle is blocked inside a probe, then disarm.
        prober.started.notified().await;
        r.ks.disarm();
        prober.open_gate(2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(r.shutdown.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_completing_after_disarm_discards_verdict() {
        let prober = StubProber::gated(false, false);
        let r = rig_with(true, prober.clone(), GuardSet::default());
        r.ks.arm();
        let epoch = r.ks.inner.lock_control().epoch;

        // Drive a cycle directly so it survives the abort of the poll task.
        let inner = r.ks.inner.clone();
        let cycle = tokio::spawn(async move { inner.run_cycle(epoch).await });
        prober.started.notified().await;

        r.ks.disarm();
        prober.open_gate(4);

        assert_eq!(cycle.await.unwrap(), CycleOutcome::Discarded);
        assert!(r.shutdown.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_skipped_when_disarmed() {
        let r = rig(false, false, false);
        let epoch = r.ks.inner.lock_control().epoch;
        assert_eq!(r.ks.inner.run_cycle(epoch).await, CycleOutcome::Discarded);
        assert_eq!(r.link.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_disarm_polls_again() {
        let mut r = rig(true, true, true);
        r.ks.arm();
        r.ks.disarm();
        r.ks.set_armed(true);
        assert_eq!(r.ks.state(), ArmState::Armed);

        let event = next_matching(&mut r.rx, is_cycle_end).await;
        assert!(matches!(event, KillSwitchEvent::ConnectivityOk { .. }));
        assert_eq!(r.prober.calls(), 2);
        r.ks.set_armed(false);
        assert_eq!(r.ks.state(), ArmState::Disarmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_shutdown_is_allowed() {
        let mut r = rig(false, false, false);
        r.ks.arm();
        next_matching(&mut r.rx, is_cycle_end).await;
        assert_eq!(r.ks.state(), ArmState::Disarmed);

        r.ks.arm();
        next_matching(&mut r.rx, is_cycle_end).await;
        assert_eq!(r.shutdown.reasons().len(), 2);
    }
}
