//! `tandem config show|path|write-default`

use anyhow::{Context, Result};
use clap::Subcommand;

use tandem_core::{config, SyncConfig};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as YAML.
    Show,
    /// Print the config file location.
    Path,
    /// Write the defaults to the config file, replacing any existing one.
    WriteDefault,
}

pub fn run(command: ConfigCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        ConfigCommand::Show => {
            let config = config::load_at(&home).context("failed to load config")?;
            print!(
                "{}",
                config::to_yaml(&config).context("failed to render config")?
            );
        }
        ConfigCommand::Path => {
            println!("{}", config::config_path_at(&home).display());
        }
        ConfigCommand::WriteDefault => {
            let path = config::save_at(&home, &SyncConfig::default())
                .context("failed to write default config")?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}
