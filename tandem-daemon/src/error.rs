use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the sync runtime, control protocol, and collaborators.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] tandem_core::ConfigError),

    #[error("vcs error: {0}")]
    Vcs(#[from] tandem_vcs::VcsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to bind trigger listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("watcher exited: {0}")]
    WatcherExited(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
