//! Peer discovery from the ssh environment and remote bootstrap over ssh.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;

use tandem_core::{PeerAddress, PeerHost, ResolvedPeer};

use crate::error::DaemonError;

/// Client address from an `SSH_CLIENT` value (`"<ip> <port> <port>"`).
pub fn ssh_client_host(value: &str) -> Option<String> {
    value
        .split_whitespace()
        .next()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}

/// The peer to use from startup: named hosts resolve directly, `auto`
/// resolves from `SSH_CLIENT` when the process was started over ssh.
pub fn initial_peer(peer: &PeerAddress, ssh_client: Option<&str>) -> Option<ResolvedPeer> {
    match &peer.host {
        PeerHost::Named(_) => peer.resolved(),
        PeerHost::Auto => {
            let host = ssh_client.and_then(ssh_client_host)?;
            tracing::info!(host = %host, "auto-detected peer host from SSH_CLIENT");
            Some(peer.resolve(host))
        }
    }
}

/// Everything needed to start the peer side of a sync pair over ssh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLaunch {
    /// `[user@]host` for ssh.
    pub target: String,
    /// Folder on the peer to sync.
    pub folder: String,
    /// Local sync root, as the peer will address it.
    pub local_root: PathBuf,
    /// Local login the peer uses to pull back from us.
    pub local_user: Option<String>,
    pub port: u16,
    /// `tandem` executable name on the peer.
    pub program: String,
}

impl RemoteLaunch {
    pub fn new(
        peer: &ResolvedPeer,
        local_root: PathBuf,
        local_user: Option<String>,
        port: u16,
    ) -> Self {
        Self {
            target: peer.ssh_target(),
            folder: peer.folder.clone(),
            local_root,
            local_user,
            port,
            program: "tandem".to_string(),
        }
    }

    /// Shell command run on the peer.
    pub fn remote_command(&self) -> String {
        let back = match &self.local_user {
            Some(user) => format!("{user}@auto:{}", self.local_root.display()),
            None => format!("auto:{}", self.local_root.display()),
        };
        format!(
            "mkdir -p {folder} && cd {folder} && {program} start {back} --port {port}",
            folder = shell_quote(&self.folder),
            program = self.program,
            back = shell_quote(&back),
            port = self.port,
        )
    }

    pub fn ssh_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            self.target.clone(),
            self.remote_command(),
        ]
    }
}

/// Run the remote daemon over ssh, relaying its output as `[remote]` lines.
/// The ssh session ending is logged, never fatal.
pub async fn run_remote(
    launch: RemoteLaunch,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    tracing::info!(
        host = %launch.target,
        command = %launch.remote_command(),
        "launching peer over ssh",
    );
    let mut child = match Command::new("ssh")
        .args(launch.ssh_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(error = %err, "could not start ssh");
            return Ok(());
        }
    };

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(relay(stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(relay(stderr));
    }

    tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("closing ssh connection to peer");
        }
        status = child.wait() => match status {
            Ok(status) => tracing::warn!(status = %status, "ssh connection terminated"),
            Err(err) => tracing::warn!(error = %err, "ssh connection lost"),
        },
    }
    Ok(())
}

async fn relay<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!("[remote] {line}");
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
