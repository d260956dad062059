//! Watch event adapter and the two watcher sources feeding it.
//!
//! Both sources produce [`WatchEvent`]s relative to the sync root. The adapter
//! drops anything inside the VCS metadata directory and forwards the rest to
//! the sync loop, one message (and so one scheduler trigger) per event.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, RecursiveMode, Watcher};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};

use tandem_core::{EventKind, RelPath, WatchEvent};

use crate::error::DaemonError;
use crate::sync_loop::SyncHandle;

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatchAdapter {
    root: PathBuf,
    metadata_dir: String,
    sync: SyncHandle,
}

impl WatchAdapter {
    pub fn new(root: impl Into<PathBuf>, metadata_dir: impl Into<String>, sync: SyncHandle) -> Self {
        Self {
            root: root.into(),
            metadata_dir: metadata_dir.into(),
            sync,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn accepts(&self, event: &WatchEvent) -> bool {
        !event.path.is_within(&self.metadata_dir)
    }

    /// Forward one event. Only a closed sync loop is an error.
    pub async fn forward(&self, event: WatchEvent) -> Result<(), DaemonError> {
        if !self.accepts(&event) {
            tracing::trace!(path = %event.path, "ignoring metadata change");
            return Ok(());
        }
        self.sync.record(event).await
    }

    /// Parse and forward one watcher output line. Malformed lines are logged
    /// and dropped.
    pub async fn forward_line(&self, line: &str) -> Result<(), DaemonError> {
        match parse_watch_line(line, &self.root) {
            Ok(Some(event)) => self.forward(event).await,
            Ok(None) => Ok(()),
            Err(err) => {
                tracing::warn!(line, error = %err, "dropping malformed watcher line");
                Ok(())
            }
        }
    }
}

/// Parse `"<kind> <path>"`. Blank lines and paths outside `root` yield
/// `Ok(None)`.
pub fn parse_watch_line(line: &str, root: &Path) -> Result<Option<WatchEvent>, DaemonError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let (kind, path) = line
        .split_once(' ')
        .ok_or_else(|| DaemonError::Protocol(format!("expected '<kind> <path>', got '{line}'")))?;
    let kind: EventKind = kind
        .parse()
        .map_err(|err: tandem_core::ParseError| DaemonError::Protocol(err.to_string()))?;
    if path.is_empty() {
        return Err(DaemonError::Protocol(format!("missing path in '{line}'")));
    }
    Ok(relativize(Path::new(path), root).map(|path| WatchEvent { kind, path }))
}

/// Express `path` relative to `root` with `/` separators. Returns `None` for
/// the root itself, for paths outside it, and for paths climbing with `..`.
pub fn relativize(path: &Path, root: &Path) -> Option<RelPath> {
    let relative = if path.is_absolute() {
        path.strip_prefix(root).ok()?
    } else {
        path
    };
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(RelPath(parts.join("/")))
    }
}

// ---------------------------------------------------------------------------
// External watcher process
// ---------------------------------------------------------------------------

/// Run `program args.. <root>` and forward each stdout line. The process
/// exiting (for any reason) is fatal.
pub async fn run_command_watcher(
    adapter: WatchAdapter,
    program: String,
    args: Vec<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut child = Command::new(&program)
        .args(&args)
        .arg(adapter.root())
        .current_dir(adapter.root())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| DaemonError::WatcherExited(format!("failed to start {program}: {err}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DaemonError::WatcherExited(format!("{program} has no stdout")))?;
    tracing::info!(program = %program, root = %adapter.root().display(), "starting watcher process");

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => adapter.forward_line(&line).await?,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher output unreadable");
                        break;
                    }
                }
            }
        }
    }

    let status = child.wait().await.map_err(|err| {
        DaemonError::WatcherExited(format!("{program} could not be reaped: {err}"))
    })?;
    tracing::error!(program = %program, status = %status, "watcher exited");
    Err(DaemonError::WatcherExited(format!("{program} exited with {status}")))
}

// ---------------------------------------------------------------------------
// Built-in watcher
// ---------------------------------------------------------------------------

/// Watch the adapter's root recursively with `notify`.
pub async fn run_builtin_watcher(
    adapter: WatchAdapter,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(adapter.root(), RecursiveMode::Recursive)?;
    tracing::info!(root = %adapter.root().display(), "watching sync root");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                for (kind, path) in classify(&event) {
                    if let Some(path) = relativize(&path, adapter.root()) {
                        adapter.forward(WatchEvent { kind, path }).await?;
                    }
                }
            }
        }
    }

    Err(DaemonError::WatcherExited(
        "filesystem watcher stopped delivering events".to_string(),
    ))
}

/// Map one `notify` event onto added / changed / removed paths.
pub fn classify(event: &Event) -> Vec<(EventKind, PathBuf)> {
    use notify::EventKind as N;

    let each = |kind: EventKind| {
        event
            .paths
            .iter()
            .map(|path| (kind, path.clone()))
            .collect::<Vec<_>>()
    };
    match &event.kind {
        N::Create(_) => each(EventKind::Added),
        N::Remove(_) => each(EventKind::Removed),
        N::Modify(ModifyKind::Name(RenameMode::From)) => each(EventKind::Removed),
        N::Modify(ModifyKind::Name(RenameMode::To)) => each(EventKind::Added),
        N::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push((EventKind::Removed, from.clone()));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((EventKind::Added, to.clone()));
            }
            out
        }
        // Platform could not tell which side of the rename this is.
        N::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|path| {
                let kind = if path.exists() {
                    EventKind::Added
                } else {
                    EventKind::Removed
                };
                (kind, path.clone())
            })
            .collect(),
        N::Modify(_) => each(EventKind::Changed),
        N::Access(_) | N::Any | N::Other => Vec::new(),
    }
}
