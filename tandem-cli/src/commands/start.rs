//! `tandem start <PEER>`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use tandem_core::{config, PeerAddress, SyncConfig, WatcherConfig};
use tandem_daemon::{start_blocking, DaemonOptions};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Peer to sync with: `[user@]host:folder`, or `auto:folder` to take the
    /// host from the ssh session or the first inbound trigger.
    pub peer: PeerAddress,

    /// Local folder to sync.
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Login on the peer (overrides the user in PEER).
    #[arg(long)]
    pub user: Option<String>,

    /// Trigger port, used both locally and on the peer.
    #[arg(long)]
    pub port: Option<u16>,

    /// Start the peer side too, over ssh.
    #[arg(long)]
    pub launch_remote: bool,

    /// External watcher printing `<kind> <path>` lines; the sync root is
    /// appended as its last argument.
    #[arg(
        long = "watch-cmd",
        value_name = "PROG [ARGS]...",
        num_args = 1..,
        allow_hyphen_values = true
    )]
    pub watch_cmd: Option<Vec<String>>,

    /// Log as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

impl StartArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home).context("failed to load ~/.tandem/config.yaml")?;
        let options = self.into_options(home, config)?;
        start_blocking(options).context("daemon exited with error")
    }

    fn into_options(self, home: PathBuf, mut config: SyncConfig) -> Result<DaemonOptions> {
        let mut peer = self.peer;
        if let Some(user) = self.user {
            peer.user = Some(user);
        }
        if let Some(port) = self.port {
            config.http_port = port;
        }
        if let Some(mut command) = self.watch_cmd {
            if command.is_empty() {
                bail!("--watch-cmd needs a program");
            }
            let program = command.remove(0);
            config.watcher = WatcherConfig::Command {
                program,
                args: command,
            };
        }
        if !self.root.is_dir() {
            bail!("sync root '{}' is not a directory", self.root.display());
        }

        Ok(DaemonOptions {
            home,
            root: self.root,
            peer,
            config,
            launch_remote: self.launch_remote,
            log_json: self.log_json,
        })
    }
}
