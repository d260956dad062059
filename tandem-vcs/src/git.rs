//! `git` subprocess backend.
//!
//! Every invocation runs in the sync root with stdin closed, prompts
//! disabled, and the configured committer identity passed as `-c` overrides,
//! so commits work on hosts that have no global git identity.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use tandem_core::{RelPath, Revision, SyncConfig};

use crate::error::{io_err, VcsError};
use crate::Vcs;

/// Written on first init when the folder has no ignore file.
pub const DEFAULT_IGNORE: &str = "# Added by tandem during repo init:\n*.lock\n.#*\n";

/// Used for pulls over ssh: never prompt, accept unknown host keys.
pub const DEFAULT_SSH_COMMAND: &str = "ssh -o BatchMode=yes -o StrictHostKeyChecking=no";

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

/// [`Vcs`] implementation that runs the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    workdir: PathBuf,
    metadata_dir: String,
    author: Option<(String, String)>,
    timeout: Option<Duration>,
    ssh_command: Option<String>,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: "git".to_string(),
            workdir: workdir.into(),
            metadata_dir: ".git".to_string(),
            author: None,
            timeout: None,
            ssh_command: Some(DEFAULT_SSH_COMMAND.to_string()),
        }
    }

    /// Build from the daemon configuration.
    pub fn from_config(workdir: impl Into<PathBuf>, config: &SyncConfig) -> Self {
        Self::new(workdir)
            .program(&config.vcs_program)
            .metadata_dir(&config.metadata_dir)
            .author(&config.author_name, &config.author_email)
            .timeout(config.command_timeout())
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn metadata_dir(mut self, dir: impl Into<String>) -> Self {
        self.metadata_dir = dir.into();
        self
    }

    pub fn author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author = Some((name.into(), email.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ssh_command(mut self, command: Option<String>) -> Self {
        self.ssh_command = command;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the metadata directory exists in the working tree.
    pub fn is_initialized(&self) -> bool {
        self.workdir.join(&self.metadata_dir).exists()
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    /// Run one command and return its raw output, whatever the exit status.
    async fn run(&self, args: &[&str]) -> Result<Output, VcsError> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some((name, email)) = &self.author {
            cmd.arg("-c")
                .arg(format!("user.name={name}"))
                .arg("-c")
                .arg(format!("user.email={email}"));
        }
        if let Some(ssh) = &self.ssh_command {
            cmd.env("GIT_SSH_COMMAND", ssh);
        }
        cmd.args(args);

        tracing::debug!("running `{}` in {}", self.describe(args), self.workdir.display());

        let spawn_err = |source| VcsError::Spawn {
            program: self.program.clone(),
            source,
        };
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(result) => result.map_err(spawn_err),
                Err(_) => Err(VcsError::TimedOut {
                    command: self.describe(args),
                    timeout: limit,
                }),
            },
            None => cmd.output().await.map_err(spawn_err),
        }
    }

    /// Run one command, mapping a non-zero exit to [`VcsError::Failed`].
    async fn run_checked(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(failure(self.describe(args), &output))
        }
    }

    async fn write_default_ignore(&self) -> Result<(), VcsError> {
        let path = self.workdir.join(".gitignore");
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err(&path, e))?
        {
            return Ok(());
        }
        tokio::fs::write(&path, DEFAULT_IGNORE)
            .await
            .map_err(|e| io_err(&path, e))?;
        tracing::info!("wrote default ignore file: {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn init(&self, branch: &str) -> Result<(), VcsError> {
        let fresh = !self.is_initialized();
        self.run_checked(&["init", "-q"]).await?;
        if fresh {
            let head = format!("refs/heads/{branch}");
            self.run_checked(&["symbolic-ref", "HEAD", &head]).await?;
            self.write_default_ignore().await?;
            tracing::info!("initialized repository in {}", self.workdir.display());
        }
        Ok(())
    }

    async fn stage_all(&self) -> Result<(), VcsError> {
        self.run_checked(&["add", "--all", "."]).await.map(|_| ())
    }

    async fn stage(&self, path: &RelPath) -> Result<(), VcsError> {
        let args = ["add", "--all", "--", path.as_str()];
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Ignored or already-vanished paths have nothing to stage.
        if stderr.contains("ignored by one of your .gitignore files")
            || stderr.contains("did not match any files")
        {
            tracing::debug!("nothing to stage for {path}: {}", stderr.trim());
            return Ok(());
        }
        Err(failure(self.describe(&args), &output))
    }

    async fn unstage(&self, path: &RelPath) -> Result<(), VcsError> {
        self.run_checked(&["rm", "--cached", "-r", "-q", "--ignore-unmatch", "--", path.as_str()])
            .await
            .map(|_| ())
    }

    async fn commit(&self, message: &str, allow_empty: bool) -> Result<(), VcsError> {
        let mut args = vec!["commit", "--untracked-files=no", "-a", "-m", message];
        if allow_empty {
            args.push("--allow-empty");
        }
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("nothing to commit") || stdout.contains("no changes added to commit") {
            tracing::debug!("nothing to commit in {}", self.workdir.display());
            return Ok(());
        }
        Err(failure(self.describe(&args), &output))
    }

    async fn current_revision(&self) -> Result<Option<Revision>, VcsError> {
        let args = ["rev-parse", "--verify", "-q", "HEAD"];
        let output = self.run(&args).await?;
        if output.status.success() {
            let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok((!rev.is_empty()).then(|| Revision::from(rev)));
        }
        // `--verify -q` exits 1 silently when HEAD is unborn.
        if output.status.code() == Some(1) {
            return Ok(None);
        }
        Err(failure(self.describe(&args), &output))
    }

    async fn set_remote(&self, name: &str, url: &str) -> Result<(), VcsError> {
        // Absent remote is fine; anything else surfaces on `remote add`.
        let _ = self.run(&["remote", "remove", name]).await?;
        self.run_checked(&["remote", "add", name, url]).await.map(|_| ())
    }

    async fn pull(&self, remote: &str, branch: &str) -> Result<(), VcsError> {
        let out = self
            .run_checked(&[
                "pull",
                "--no-rebase",
                "--no-edit",
                "--allow-unrelated-histories",
                remote,
                branch,
            ])
            .await?;
        tracing::info!("pulled {remote}/{branch}: {}", out.trim());
        Ok(())
    }
}

fn failure(command: String, output: &Output) -> VcsError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stderr = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    VcsError::Failed {
        command,
        code: output.status.code().unwrap_or(-1),
        stderr,
    }
}
