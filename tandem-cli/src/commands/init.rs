//! `tandem init [PATH]`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use tandem_core::{config, SyncConfig};
use tandem_vcs::{GitCli, Vcs};

/// Initialize a folder for syncing without starting the daemon.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Folder to initialize.
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home).context("failed to load ~/.tandem/config.yaml")?;
        let path = self
            .path
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.path.display()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build async runtime")?;
        let created = runtime.block_on(init_folder(&path, &config))?;

        if created {
            println!("✓ Initialized '{}' with a baseline commit", path.display());
        } else {
            println!("✓ '{}' already has history; nothing to do", path.display());
        }
        Ok(())
    }
}

/// Returns `true` when a baseline commit was created.
async fn init_folder(path: &Path, config: &SyncConfig) -> Result<bool> {
    let repo = GitCli::from_config(path, config);
    repo.init(&config.branch)
        .await
        .with_context(|| format!("failed to init '{}'", path.display()))?;
    if repo.current_revision().await?.is_some() {
        return Ok(false);
    }
    repo.stage_all().await.context("failed to stage files")?;
    repo.commit(&config.baseline_message, true)
        .await
        .context("failed to create baseline commit")?;
    Ok(true)
}
