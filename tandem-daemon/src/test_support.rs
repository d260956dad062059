//! In-memory fakes for the VCS and peer notifier.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use tandem_core::{RelPath, ResolvedPeer, Revision};
use tandem_vcs::{Vcs, VcsError};

use crate::error::DaemonError;
use crate::notifier::PeerNotifier;

#[derive(Debug, Default)]
struct FakeRepo {
    calls: Vec<String>,
    fail: HashSet<String>,
    unchanged: HashSet<String>,
    revision: u32,
    dirty: bool,
    initialized: bool,
    delay: Duration,
}

/// Records every call as a short string and keeps a counter revision that
/// advances on each commit that has something to commit.
#[derive(Debug, Default)]
pub(crate) struct FakeVcs {
    repo: Mutex<FakeRepo>,
}

impl FakeVcs {
    /// Every call sleeps for `delay` (virtual time under `start_paused`).
    pub(crate) fn with_delay(delay: Duration) -> Self {
        let vcs = Self::default();
        vcs.lock().delay = delay;
        vcs
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make the call whose recorded form is `call` fail.
    pub(crate) fn fail_on(&self, call: &str) {
        self.lock().fail.insert(call.to_string());
    }

    /// Staging `path` leaves the tree identical to the head.
    pub(crate) fn mark_unchanged(&self, path: &str) {
        self.lock().unchanged.insert(path.to_string());
    }

    pub(crate) fn commits(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with("commit"))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeRepo> {
        self.repo.lock().expect("fake repo lock")
    }

    async fn call(&self, call: String) -> Result<(), VcsError> {
        let delay = self.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut repo = self.lock();
        let failed = repo.fail.contains(&call);
        repo.calls.push(call.clone());
        if failed {
            return Err(VcsError::Failed {
                command: call,
                code: 1,
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn init(&self, branch: &str) -> Result<(), VcsError> {
        self.call(format!("init {branch}")).await?;
        self.lock().initialized = true;
        Ok(())
    }

    async fn stage_all(&self) -> Result<(), VcsError> {
        self.call("stage-all".to_string()).await?;
        self.lock().dirty = true;
        Ok(())
    }

    async fn stage(&self, path: &RelPath) -> Result<(), VcsError> {
        self.call(format!("stage {path}")).await?;
        let mut repo = self.lock();
        if !repo.unchanged.contains(path.as_str()) {
            repo.dirty = true;
        }
        Ok(())
    }

    async fn unstage(&self, path: &RelPath) -> Result<(), VcsError> {
        self.call(format!("unstage {path}")).await?;
        self.lock().dirty = true;
        Ok(())
    }

    async fn commit(&self, message: &str, allow_empty: bool) -> Result<(), VcsError> {
        let call = if allow_empty {
            format!("commit {message} allow-empty")
        } else {
            format!("commit {message}")
        };
        self.call(call).await?;
        let mut repo = self.lock();
        if repo.dirty || allow_empty {
            repo.revision += 1;
            repo.dirty = false;
        }
        Ok(())
    }

    async fn current_revision(&self) -> Result<Option<Revision>, VcsError> {
        self.call("rev-parse".to_string()).await?;
        let repo = self.lock();
        if !repo.initialized {
            // What git reports outside a repository.
            return Err(VcsError::Failed {
                command: "git rev-parse --verify -q HEAD".to_string(),
                code: 128,
                stderr: "fatal: not a git repository".to_string(),
            });
        }
        let revision = repo.revision;
        Ok((revision > 0).then(|| Revision::from(format!("{revision:040x}"))))
    }

    async fn set_remote(&self, name: &str, url: &str) -> Result<(), VcsError> {
        self.call(format!("set-remote {name} {url}")).await
    }

    async fn pull(&self, remote: &str, branch: &str) -> Result<(), VcsError> {
        self.call(format!("pull {remote} {branch}")).await?;
        self.lock().revision += 1;
        Ok(())
    }
}

/// Counts notifications started and finished; can be told to fail or to
/// take a while.
#[derive(Debug, Default)]
pub(crate) struct FakeNotifier {
    count: AtomicUsize,
    completed: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl FakeNotifier {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
    }

    pub(crate) fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerNotifier for FakeNotifier {
    async fn notify(&self, peer: &ResolvedPeer) -> Result<(), DaemonError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DaemonError::Protocol(format!(
                "notify {} failed: injected",
                peer.host
            )));
        }
        Ok(())
    }
}
