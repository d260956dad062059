//! Sync orchestrator: decides what one cycle does and runs its VCS command
//! sequence.
//!
//! Planning and execution are split. [`Orchestrator::plan`] runs on the sync
//! loop and is the only place the pull flag is consumed and the change set is
//! drained. [`Orchestrator::execute`] runs in the cycle task and never touches
//! loop state, so events recorded mid-cycle always land in the next drain.
//!
//! A cycle that moves the head names the peer to notify in its report; the
//! sync loop sends that notification detached from the cycle.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use tandem_core::{
    ChangeSet, DrainedChanges, RelPath, ResolvedPeer, Revision, SyncConfig, WatchEvent,
};
use tandem_vcs::{Vcs, VcsError};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Nothing has run yet in this process.
    Uninitialized,
    Bootstrapping,
    /// Idle between cycles.
    Ready,
    Pulling,
    Committing,
}

/// Work accumulated between cycles. Owned by the sync loop.
#[derive(Debug, Default)]
pub struct PendingWork {
    pub changes: ChangeSet,
    pub pull_requested: bool,
}

impl PendingWork {
    pub fn record(&mut self, event: WatchEvent) {
        self.changes.record_event(event);
    }

    pub fn request_pull(&mut self) {
        self.pull_requested = true;
    }

    pub fn has_work(&self) -> bool {
        self.pull_requested || !self.changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CyclePlan {
    Bootstrap,
    Pull,
    Commit(DrainedChanges),
    Idle,
}

impl CyclePlan {
    pub fn kind(&self) -> CycleKind {
        match self {
            CyclePlan::Bootstrap => CycleKind::Bootstrap,
            CyclePlan::Pull => CycleKind::Pull,
            CyclePlan::Commit(_) => CycleKind::Commit,
            CyclePlan::Idle => CycleKind::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Bootstrap,
    Pull,
    Commit,
    Idle,
}

/// Outcome of one executed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub kind: CycleKind,
    /// Set only when the head moved because of a commit made by this cycle.
    pub new_revision: Option<Revision>,
    pub head: Option<Revision>,
    pub staged: usize,
    pub unstaged: usize,
    pub command_failures: usize,
    /// Peer to tell about `new_revision`, when its host is known.
    pub notify_peer: Option<ResolvedPeer>,
    /// A pull was planned but the peer host is not known yet.
    pub skipped: bool,
    pub duration_ms: u128,
}

impl CycleReport {
    fn new(kind: CycleKind) -> Self {
        Self {
            kind,
            new_revision: None,
            head: None,
            staged: 0,
            unstaged: 0,
            command_failures: 0,
            notify_peer: None,
            skipped: false,
            duration_ms: 0,
        }
    }
}

/// Names and messages the orchestrator passes to the VCS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub remote_name: String,
    pub branch: String,
    pub commit_message: String,
    pub baseline_message: String,
}

impl From<&SyncConfig> for OrchestratorSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            remote_name: config.remote_name.clone(),
            branch: config.branch.clone(),
            commit_message: config.commit_message.clone(),
            baseline_message: config.baseline_message.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    vcs: Arc<dyn Vcs>,
    settings: OrchestratorSettings,
    state: OrchestratorState,
}

impl Orchestrator {
    pub fn new(vcs: Arc<dyn Vcs>, settings: OrchestratorSettings) -> Self {
        Self {
            vcs,
            settings,
            state: OrchestratorState::Uninitialized,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Choose this cycle's work, consuming whatever it takes from `pending`.
    pub fn plan(&self, pending: &mut PendingWork) -> CyclePlan {
        if self.state == OrchestratorState::Uninitialized {
            return CyclePlan::Bootstrap;
        }
        if pending.pull_requested {
            pending.pull_requested = false;
            return CyclePlan::Pull;
        }
        if !pending.changes.is_empty() {
            return CyclePlan::Commit(pending.changes.drain());
        }
        CyclePlan::Idle
    }

    /// Run one planned cycle to completion. VCS failures are logged and
    /// counted in the report; they never abort the cycle early.
    pub async fn execute(&mut self, plan: CyclePlan, peer: Option<ResolvedPeer>) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(plan.kind());
        match plan {
            CyclePlan::Bootstrap => self.bootstrap(peer.as_ref(), &mut report).await,
            CyclePlan::Pull => self.pull(peer.as_ref(), &mut report).await,
            CyclePlan::Commit(changes) => self.commit(changes, peer.as_ref(), &mut report).await,
            CyclePlan::Idle => {}
        }
        report.duration_ms = started.elapsed().as_millis();
        report
    }

    async fn bootstrap(&mut self, peer: Option<&ResolvedPeer>, report: &mut CycleReport) {
        self.state = OrchestratorState::Bootstrapping;
        tracing::info!("initializing repository and creating baseline commit");

        // HEAD cannot be read before the repository exists.
        if let Err(err) = self.vcs.init(&self.settings.branch).await {
            command_failed(report, "init", &err);
            self.state = OrchestratorState::Ready;
            return;
        }
        let before = self.read_revision(report).await;
        let steps = async {
            self.vcs.stage_all().await?;
            self.vcs.commit(&self.settings.baseline_message, true).await
        };
        if let Err(err) = steps.await {
            command_failed(report, "baseline commit", &err);
        }
        let after = self.read_revision(report).await;

        self.state = OrchestratorState::Ready;
        finish_commit(before, after, peer, report);
    }

    async fn pull(&mut self, peer: Option<&ResolvedPeer>, report: &mut CycleReport) {
        let Some(peer) = peer else {
            tracing::warn!("pull requested but the peer host is not known yet; skipping");
            report.skipped = true;
            return;
        };
        self.state = OrchestratorState::Pulling;
        let url = peer.remote_url();
        tracing::info!(remote = %self.settings.remote_name, url = %url, "pulling from peer");

        let steps = async {
            self.vcs.set_remote(&self.settings.remote_name, &url).await?;
            self.vcs
                .pull(&self.settings.remote_name, &self.settings.branch)
                .await
        };
        if let Err(err) = steps.await {
            command_failed(report, "pull", &err);
        }
        report.head = self.read_revision(report).await.flatten();
        self.state = OrchestratorState::Ready;
    }

    async fn commit(
        &mut self,
        changes: DrainedChanges,
        peer: Option<&ResolvedPeer>,
        report: &mut CycleReport,
    ) {
        self.state = OrchestratorState::Committing;
        tracing::info!(
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            "committing local changes",
        );

        let before = self.read_revision(report).await;

        report.staged = self.apply_batch(Batch::Stage, &changes.changed, report).await;
        report.unstaged = self
            .apply_batch(Batch::Unstage, &changes.removed, report)
            .await;

        if let Err(err) = self.vcs.commit(&self.settings.commit_message, false).await {
            command_failed(report, "commit", &err);
        }
        let after = self.read_revision(report).await;

        self.state = OrchestratorState::Ready;
        finish_commit(before, after, peer, report);
    }

    /// Apply `batch` to each path in order, stopping at the first failure.
    /// Returns how many succeeded.
    async fn apply_batch(
        &self,
        batch: Batch,
        paths: &[RelPath],
        report: &mut CycleReport,
    ) -> usize {
        let mut done = 0;
        for path in paths {
            let result = match batch {
                Batch::Stage => self.vcs.stage(path).await,
                Batch::Unstage => self.vcs.unstage(path).await,
            };
            match result {
                Ok(()) => done += 1,
                Err(err) => {
                    command_failed(report, batch.label(), &err);
                    let skipped = paths.len() - done - 1;
                    if skipped > 0 {
                        tracing::warn!(
                            path = %path,
                            skipped,
                            "{} batch stopped at first failure",
                            batch.label()
                        );
                    }
                    break;
                }
            }
        }
        done
    }

    /// `Some(None)` means an unborn head; `None` means the read failed.
    async fn read_revision(&self, report: &mut CycleReport) -> Option<Option<Revision>> {
        match self.vcs.current_revision().await {
            Ok(rev) => Some(rev),
            Err(err) => {
                command_failed(report, "rev-parse", &err);
                None
            }
        }
    }
}

fn finish_commit(
    before: Option<Option<Revision>>,
    after: Option<Option<Revision>>,
    peer: Option<&ResolvedPeer>,
    report: &mut CycleReport,
) {
    report.head = after.clone().flatten();
    let (Some(before), Some(Some(after))) = (before, after) else {
        return;
    };
    if before.as_ref() == Some(&after) {
        tracing::info!(head = %after.short(), "nothing new to commit");
        return;
    }
    tracing::info!(revision = %after.short(), "made a new commit");
    report.new_revision = Some(after);
    match peer {
        Some(peer) => report.notify_peer = Some(peer.clone()),
        None => tracing::warn!("peer host not known yet; not notifying"),
    }
}

fn command_failed(report: &mut CycleReport, step: &'static str, err: &VcsError) {
    tracing::error!(step, error = %err, "vcs command failed");
    report.command_failures += 1;
}

#[derive(Debug, Clone, Copy)]
enum Batch {
    Stage,
    Unstage,
}

impl Batch {
    fn label(self) -> &'static str {
        match self {
            Batch::Stage => "stage",
            Batch::Unstage => "unstage",
        }
    }
}
