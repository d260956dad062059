//! tandem: keep a directory in sync with a peer, using git as the transport.
//!
//! # Usage
//!
//! ```text
//! tandem start <PEER> [--root DIR] [--user U] [--port P] [--launch-remote]
//!              [--watch-cmd PROG [ARGS..]] [--log-json]
//! tandem status [--json]
//! tandem sync | pull | stop
//! tandem init [PATH]
//! tandem config show|path|write-default
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    config::ConfigCommand, control::StatusArgs, init::InitArgs, start::StartArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    version,
    about = "Bidirectional directory sync over git",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon in the foreground.
    Start(StartArgs),

    /// Show the running daemon's state.
    Status(StatusArgs),

    /// Ask the running daemon for a commit cycle now.
    Sync,

    /// Ask the running daemon to pull from its peer.
    Pull,

    /// Stop the running daemon.
    Stop,

    /// Initialize a folder for syncing and record a baseline commit.
    Init(InitArgs),

    /// Inspect or write ~/.tandem/config.yaml.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Sync => commands::control::sync(),
        Commands::Pull => commands::control::pull(),
        Commands::Stop => commands::control::stop(),
        Commands::Init(args) => args.run(),
        Commands::Config { command } => commands::config::run(command),
    }
}
