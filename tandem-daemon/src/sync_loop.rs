//! The sync loop: single owner of the change set, the pull flag, the
//! scheduler, and the orchestrator.
//!
//! Watchers, the trigger listener, and the control socket only ever send
//! [`SyncMessage`]s through a [`SyncHandle`]. Each cycle runs as one spawned
//! task that takes the orchestrator and gives it back when it finishes, so two
//! cycle bodies can never overlap. Peer notifications run detached from the
//! cycle and report back as [`SyncMessage::Notified`].

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use tandem_core::{PeerAddress, PeerHost, ResolvedPeer, Revision, SyncConfig, WatchEvent};

use crate::error::DaemonError;
use crate::notifier::PeerNotifier;
use crate::orchestrator::{CycleKind, CycleReport, Orchestrator, OrchestratorState, PendingWork};
use crate::scheduler::{CoalescingScheduler, Decision, SchedulerSnapshot};

const SYNC_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Messages and handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SyncMessage {
    /// A filesystem event that already passed the metadata filter.
    Watch(WatchEvent),
    /// The peer announced a new revision.
    PullRequested { from: Option<IpAddr> },
    /// Run a cycle for whatever is pending.
    Trigger,
    Status(oneshot::Sender<SyncStatus>),
    /// A detached peer notification finished.
    Notified { ok: bool },
}

/// Cloneable sender side of the sync loop.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncMessage>,
}

impl SyncHandle {
    pub fn new(tx: mpsc::Sender<SyncMessage>) -> Self {
        Self { tx }
    }

    pub async fn record(&self, event: WatchEvent) -> Result<(), DaemonError> {
        self.send(SyncMessage::Watch(event)).await
    }

    pub async fn request_pull(&self, from: Option<IpAddr>) -> Result<(), DaemonError> {
        self.send(SyncMessage::PullRequested { from }).await
    }

    pub async fn trigger(&self) -> Result<(), DaemonError> {
        self.send(SyncMessage::Trigger).await
    }

    pub async fn status(&self) -> Result<SyncStatus, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncMessage::Status(tx)).await?;
        rx.await
            .map_err(|_| DaemonError::ChannelClosed("sync status response"))
    }

    async fn send(&self, message: SyncMessage) -> Result<(), DaemonError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| DaemonError::ChannelClosed("sync queue"))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub events: u64,
    pub cycles: u64,
    pub commits: u64,
    pub pulls: u64,
    pub notifications: u64,
    pub notify_failures: u64,
    pub command_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<CycleKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        if report.new_revision.is_some() {
            self.commits += 1;
        }
        if report.kind == CycleKind::Pull && !report.skipped {
            self.pulls += 1;
        }
        self.command_failures += report.command_failures as u64;
        self.last_cycle = Some(report.kind);
        self.last_cycle_at = Some(Utc::now());
    }
}

/// Snapshot returned to the control socket.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: OrchestratorState,
    pub scheduler: SchedulerSnapshot,
    pub pending_changed: usize,
    pub pending_removed: usize,
    pub pull_requested: bool,
    pub peer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<Revision>,
    pub started_at: DateTime<Utc>,
    pub stats: SyncStats,
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

struct RunningCycle {
    kind: CycleKind,
    handle: JoinHandle<(Orchestrator, CycleReport)>,
}

enum LoopEvent {
    Message(SyncMessage),
    CooldownElapsed,
    Settled,
    Finished(Result<(Orchestrator, CycleReport), JoinError>),
    Shutdown,
}

pub struct SyncLoop {
    rx: mpsc::Receiver<SyncMessage>,
    /// Weak, so the loop still sees its queue close when every handle is gone.
    notify_tx: mpsc::WeakSender<SyncMessage>,
    notifier: Arc<dyn PeerNotifier>,
    pending: PendingWork,
    scheduler: CoalescingScheduler,
    orchestrator: Option<Orchestrator>,
    running: Option<RunningCycle>,
    settle_until: Option<Instant>,
    peer: PeerAddress,
    resolved: Option<ResolvedPeer>,
    pull_on_start: bool,
    head: Option<Revision>,
    stats: SyncStats,
    started_at: DateTime<Utc>,
}

impl SyncLoop {
    /// `resolved` is the peer to use from the start, if known.
    pub fn new(
        config: &SyncConfig,
        orchestrator: Orchestrator,
        notifier: Arc<dyn PeerNotifier>,
        peer: PeerAddress,
        resolved: Option<ResolvedPeer>,
    ) -> (Self, SyncHandle) {
        let (tx, rx) = mpsc::channel(SYNC_QUEUE_CAPACITY);
        let sync_loop = Self {
            rx,
            notify_tx: tx.downgrade(),
            notifier,
            pending: PendingWork::default(),
            scheduler: CoalescingScheduler::new(config.min_spacing(), config.start_delay()),
            orchestrator: Some(orchestrator),
            running: None,
            settle_until: None,
            peer,
            resolved,
            pull_on_start: config.pull_on_start,
            head: None,
            stats: SyncStats::default(),
            started_at: Utc::now(),
        };
        (sync_loop, SyncHandle::new(tx))
    }

    /// Run until shutdown. The first cycle (bootstrap) is scheduled
    /// immediately.
    pub async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError> {
        self.trigger(Instant::now());

        loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => LoopEvent::Shutdown,
                message = self.rx.recv() => match message {
                    Some(message) => LoopEvent::Message(message),
                    None => LoopEvent::Shutdown,
                },
                _ = sleep_until_opt(self.scheduler.cooldown()) => LoopEvent::CooldownElapsed,
                _ = sleep_until_opt(self.settle_until) => LoopEvent::Settled,
                joined = join_running(&mut self.running) => LoopEvent::Finished(joined),
            };

            match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Message(message) => self.handle_message(message),
                LoopEvent::CooldownElapsed => {
                    let decision = self.scheduler.cooldown_elapsed(Instant::now());
                    self.apply(decision);
                }
                LoopEvent::Settled => {
                    self.settle_until = None;
                    self.start_cycle();
                }
                LoopEvent::Finished(joined) => {
                    self.running = None;
                    self.finish_cycle(joined)?;
                }
            }
        }

        if let Some(cycle) = self.running.take() {
            tracing::info!(kind = ?cycle.kind, "waiting for in-flight cycle before exit");
            let _ = cycle.handle.await;
        }
        Ok(())
    }

    fn handle_message(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::Watch(event) => {
                tracing::debug!(kind = %event.kind, path = %event.path, "recorded change");
                self.stats.events += 1;
                self.pending.record(event);
                self.trigger(Instant::now());
            }
            SyncMessage::PullRequested { from } => {
                tracing::info!(from = ?from, "need to pull");
                if let Some(ip) = from {
                    self.resolve_auto_peer(ip);
                }
                self.pending.request_pull();
                self.trigger(Instant::now());
            }
            SyncMessage::Trigger => self.trigger(Instant::now()),
            SyncMessage::Status(reply) => {
                let _ = reply.send(self.status());
            }
            SyncMessage::Notified { ok: true } => self.stats.notifications += 1,
            SyncMessage::Notified { ok: false } => self.stats.notify_failures += 1,
        }
    }

    /// Tell the peer about a new revision without holding up the next cycle.
    fn spawn_notify(&self, peer: ResolvedPeer) {
        let notifier = self.notifier.clone();
        let notify_tx = self.notify_tx.clone();
        tokio::spawn(async move {
            let ok = match notifier.notify(&peer).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(peer = %peer.host, error = %err, "peer notification failed");
                    false
                }
            };
            if let Some(tx) = notify_tx.upgrade() {
                let _ = tx.send(SyncMessage::Notified { ok }).await;
            }
        });
    }

    fn resolve_auto_peer(&mut self, ip: IpAddr) {
        if self.resolved.is_some() || self.peer.host != PeerHost::Auto {
            return;
        }
        let resolved = self.peer.resolve(ip.to_string());
        tracing::info!(remote = %resolved.remote_url(), "auto-detected peer from inbound trigger");
        self.resolved = Some(resolved);
    }

    fn trigger(&mut self, now: Instant) {
        let decision = self.scheduler.trigger(now);
        self.apply(decision);
    }

    fn apply(&mut self, decision: Decision) {
        match decision {
            Decision::Start { at } => self.settle_until = Some(at),
            Decision::Wait { until } => {
                let wait = until.saturating_duration_since(Instant::now());
                tracing::debug!(wait_ms = wait.as_millis() as u64, "cooling down");
            }
            Decision::Coalesced | Decision::Pending | Decision::Idle => {}
        }
    }

    fn start_cycle(&mut self) {
        let Some(mut orchestrator) = self.orchestrator.take() else {
            // Only reachable if a cycle is somehow still holding it.
            tracing::error!("cycle start without orchestrator; skipping");
            let decision = self.scheduler.complete(Instant::now());
            self.apply(decision);
            return;
        };
        let plan = orchestrator.plan(&mut self.pending);
        let kind = plan.kind();
        let peer = self.resolved.clone();
        tracing::debug!(kind = ?kind, "cycle starting");
        let handle = tokio::spawn(async move {
            let report = orchestrator.execute(plan, peer).await;
            (orchestrator, report)
        });
        self.running = Some(RunningCycle { kind, handle });
    }

    fn finish_cycle(
        &mut self,
        joined: Result<(Orchestrator, CycleReport), JoinError>,
    ) -> Result<(), DaemonError> {
        let (orchestrator, mut report) =
            joined.map_err(|err| DaemonError::Protocol(format!("sync cycle task failed: {err}")))?;
        self.orchestrator = Some(orchestrator);
        self.stats.record(&report);
        if let Some(peer) = report.notify_peer.take() {
            self.spawn_notify(peer);
        }
        if report.head.is_some() {
            self.head = report.head.clone();
        }
        if report.kind != CycleKind::Idle {
            tracing::info!(
                kind = ?report.kind,
                duration_ms = report.duration_ms as u64,
                command_failures = report.command_failures,
                "cycle finished",
            );
        }

        if report.kind == CycleKind::Bootstrap && self.pull_on_start {
            self.pending.request_pull();
        }
        // Work left behind (a deferred pull, or changes that waited out a
        // pull) gets exactly one follow-up, coalesced with any other trigger.
        let now = Instant::now();
        if self.pending.has_work() {
            let decision = self.scheduler.trigger(now);
            self.apply(decision);
        }
        let decision = self.scheduler.complete(now);
        self.apply(decision);
        Ok(())
    }

    fn status(&self) -> SyncStatus {
        let state = match &self.running {
            Some(cycle) => match cycle.kind {
                CycleKind::Bootstrap => OrchestratorState::Bootstrapping,
                CycleKind::Pull => OrchestratorState::Pulling,
                CycleKind::Commit => OrchestratorState::Committing,
                CycleKind::Idle => OrchestratorState::Ready,
            },
            None => self
                .orchestrator
                .as_ref()
                .map(Orchestrator::state)
                .unwrap_or(OrchestratorState::Ready),
        };
        SyncStatus {
            state,
            scheduler: self.scheduler.snapshot(),
            pending_changed: self.pending.changes.changed_len(),
            pending_removed: self.pending.changes.removed_len(),
            pull_requested: self.pending.pull_requested,
            peer: self.peer.to_string(),
            remote_url: self.resolved.as_ref().map(ResolvedPeer::remote_url),
            head: self.head.clone(),
            started_at: self.started_at,
            stats: self.stats.clone(),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_running(
    running: &mut Option<RunningCycle>,
) -> Result<(Orchestrator, CycleReport), JoinError> {
    match running {
        Some(cycle) => (&mut cycle.handle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::orchestrator::OrchestratorSettings;
    use crate::test_support::{FakeNotifier, FakeVcs};
    use tandem_core::EventKind;

    struct Harness {
        handle: SyncHandle,
        shutdown: broadcast::Sender<()>,
        task: JoinHandle<Result<(), DaemonError>>,
        vcs: Arc<FakeVcs>,
        notifier: Arc<FakeNotifier>,
    }

    fn config(pull_on_start: bool) -> SyncConfig {
        SyncConfig {
            pull_on_start,
            ..SyncConfig::default()
        }
    }

    fn start(vcs: FakeVcs, config: SyncConfig, peer: &str) -> Harness {
        start_with(vcs, FakeNotifier::default(), config, peer)
    }

    fn start_with(
        vcs: FakeVcs,
        notifier: FakeNotifier,
        config: SyncConfig,
        peer: &str,
    ) -> Harness {
        let vcs = Arc::new(vcs);
        let notifier = Arc::new(notifier);
        let orchestrator = Orchestrator::new(vcs.clone(), OrchestratorSettings::from(&config));
        let peer: PeerAddress = peer.parse().expect("peer");
        let resolved = peer.resolved();
        let (sync_loop, handle) =
            SyncLoop::new(&config, orchestrator, notifier.clone(), peer, resolved);
        let (shutdown, _) = broadcast::channel(1);
        let task = tokio::spawn(sync_loop.run(shutdown.subscribe()));
        Harness {
            handle,
            shutdown,
            task,
            vcs,
            notifier,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{call} not in {calls:?}"))
    }

    fn count(calls: &[String], call: &str) -> usize {
        calls.iter().filter(|c| *c == call).count()
    }

    async fn stop(h: Harness) {
        let _ = h.shutdown.send(());
        h.task.await.expect("join").expect("loop result");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn bootstrap_runs_once_at_startup() {
        let h = start(FakeVcs::default(), config(false), "peer.lan:/srv/notes");
        settle().await;

        let calls = h.vcs.calls();
        assert_eq!(count(&calls, "init master"), 1);
        assert_eq!(h.vcs.commits(), 1);
        assert_eq!(h.notifier.count(), 1);

        let status = h.handle.status().await.expect("status");
        assert_eq!(status.state, OrchestratorState::Ready);
        assert_eq!(status.stats.cycles, 1);
        assert_eq!(status.stats.notifications, 1);
        assert!(status.head.is_some());
        assert!(!status.scheduler.in_flight);
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn pull_on_start_pulls_once_after_bootstrap() {
        let h = start(FakeVcs::default(), config(true), "peer.lan:/srv/notes");
        settle().await;

        let calls = h.vcs.calls();
        assert_eq!(count(&calls, "pull origin master"), 1);
        assert!(position(&calls, "init master") < position(&calls, "pull origin master"));
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn burst_during_cycle_yields_exactly_one_follow_up() {
        let h = start(
            FakeVcs::with_delay(Duration::from_millis(200)),
            config(false),
            "peer.lan:/srv/notes",
        );
        settle().await;
        h.vcs.clear_calls();

        h.handle
            .record(WatchEvent::new(EventKind::Changed, "first.txt"))
            .await
            .expect("record");
        // Let the first commit cycle get past its settle delay.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = h.handle.status().await.expect("status");
        assert!(status.scheduler.in_flight);

        for i in 0..10 {
            h.handle
                .record(WatchEvent::new(EventKind::Changed, format!("burst-{i}.txt")))
                .await
                .expect("record");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        settle().await;

        let calls = h.vcs.calls();
        assert_eq!(h.vcs.commits(), 2, "one cycle for the first event, one for the burst");
        assert!(position(&calls, "stage first.txt") < position(&calls, "stage burst-0.txt"));
        assert_eq!(count(&calls, "stage burst-9.txt"), 1);

        let status = h.handle.status().await.expect("status");
        assert_eq!(status.stats.cycles, 3);
        assert_eq!(status.stats.commits, 3);
        assert!(!status.scheduler.fire_requested);
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn events_in_one_window_make_one_commit_and_one_notification() {
        let h = start(FakeVcs::default(), config(false), "peer.lan:/srv/notes");
        settle().await;
        h.vcs.clear_calls();
        h.notifier.reset();

        for (kind, path) in [
            (EventKind::Changed, "a.txt"),
            (EventKind::Changed, "b.txt"),
            (EventKind::Removed, "c.txt"),
        ] {
            h.handle
                .record(WatchEvent::new(kind, path))
                .await
                .expect("record");
        }
        settle().await;

        let calls = h.vcs.calls();
        assert_eq!(h.vcs.commits(), 1);
        assert_eq!(count(&calls, "stage a.txt"), 1);
        assert_eq!(count(&calls, "stage b.txt"), 1);
        assert_eq!(count(&calls, "unstage c.txt"), 1);
        assert!(position(&calls, "stage b.txt") < position(&calls, "unstage c.txt"));
        assert_eq!(h.notifier.count(), 1);
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn pull_request_before_bootstrap_is_deferred_to_next_cycle() {
        let h = start(FakeVcs::default(), config(false), "peer.lan:/srv/notes");
        h.handle.request_pull(None).await.expect("pull request");
        settle().await;

        let calls = h.vcs.calls();
        assert_eq!(count(&calls, "pull origin master"), 1);
        let baseline = position(&calls, "commit post-walk commit allow-empty");
        assert!(baseline < position(&calls, "pull origin master"));
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn changes_survive_a_pull_and_commit_afterwards() {
        let h = start(FakeVcs::default(), config(false), "peer.lan:/srv/notes");
        settle().await;
        h.vcs.clear_calls();

        h.handle
            .record(WatchEvent::new(EventKind::Changed, "local.txt"))
            .await
            .expect("record");
        h.handle.request_pull(None).await.expect("pull request");
        settle().await;

        let calls = h.vcs.calls();
        assert!(position(&calls, "pull origin master") < position(&calls, "stage local.txt"));
        assert_eq!(h.vcs.commits(), 1);
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn idle_trigger_commits_nothing() {
        let h = start(FakeVcs::default(), config(false), "peer.lan:/srv/notes");
        settle().await;
        h.vcs.clear_calls();
        h.notifier.reset();

        h.handle.trigger().await.expect("trigger");
        h.handle.trigger().await.expect("trigger");
        settle().await;

        assert!(h.vcs.calls().is_empty());
        assert_eq!(h.notifier.count(), 0);
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn auto_peer_resolves_from_first_inbound_trigger() {
        let h = start(FakeVcs::default(), config(false), "auto:/srv/notes");
        settle().await;
        assert_eq!(h.notifier.count(), 0, "no peer known yet");

        let ip: IpAddr = "10.1.2.3".parse().expect("ip");
        h.handle.request_pull(Some(ip)).await.expect("pull request");
        settle().await;

        let calls = h.vcs.calls();
        assert_eq!(count(&calls, "set-remote origin 10.1.2.3:/srv/notes"), 1);
        let status = h.handle.status().await.expect("status");
        assert_eq!(status.remote_url.as_deref(), Some("10.1.2.3:/srv/notes"));
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn shutdown_waits_for_running_cycle() {
        let h = start(
            FakeVcs::with_delay(Duration::from_millis(500)),
            config(false),
            "peer.lan:/srv/notes",
        );
        // Bootstrap is in flight after the settle delay.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let vcs = h.vcs.clone();
        stop(h).await;
        assert_eq!(vcs.commits(), 1, "bootstrap ran to completion");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn slow_notification_does_not_hold_up_the_next_cycle() {
        let h = start_with(
            FakeVcs::default(),
            FakeNotifier::with_delay(Duration::from_secs(30)),
            config(false),
            "peer.lan:/srv/notes",
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.notifier.count(), 1, "baseline notification started");
        assert_eq!(h.notifier.completed(), 0);

        h.handle
            .record(WatchEvent::new(EventKind::Changed, "a.txt"))
            .await
            .expect("record");
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(h.vcs.commits(), 2, "commit ran while the peer was still slow");
        assert_eq!(h.notifier.count(), 2);
        assert_eq!(h.notifier.completed(), 0);
        let status = h.handle.status().await.expect("status");
        assert!(!status.scheduler.in_flight);
        assert_eq!(status.stats.notifications, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.notifier.completed(), 2);
        let status = h.handle.status().await.expect("status");
        assert_eq!(status.stats.notifications, 2);
        stop(h).await;
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn failed_notification_is_counted_not_fatal() {
        let notifier = FakeNotifier::default();
        notifier.fail(true);
        let h = start_with(FakeVcs::default(), notifier, config(false), "peer.lan:/srv/notes");
        settle().await;

        let status = h.handle.status().await.expect("status");
        assert_eq!(status.state, OrchestratorState::Ready);
        assert_eq!(status.stats.commits, 1);
        assert_eq!(status.stats.notifications, 0);
        assert_eq!(status.stats.notify_failures, 1);
        assert_eq!(status.stats.command_failures, 0);
        stop(h).await;
    }
}
