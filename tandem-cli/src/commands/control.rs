//! Control-socket commands: `status`, `sync`, `pull`, `stop`.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use tandem_daemon::paths::socket_path;
use tandem_daemon::{request_pull, request_status, request_stop, request_sync, DaemonError};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "counter")]
    name: &'static str,
    #[tabled(rename = "value")]
    value: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let status = match request_status(&home) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => json!({
                "running": false,
                "socket": socket_path(&home).display().to_string(),
            }),
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render daemon status JSON")?
            );
        } else {
            print_status(&status);
        }
        Ok(())
    }
}

pub fn sync() -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    match request_sync(&home) {
        Ok(_) => println!("sync requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to request sync"),
    }
    Ok(())
}

pub fn pull() -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    match request_pull(&home) {
        Ok(_) => println!("pull requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to request pull"),
    }
    Ok(())
}

pub fn stop() -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    match request_stop(&home) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

fn print_status(status: &Value) {
    if status["running"] != json!(true) {
        println!("{} daemon is not running", "■".bright_black().bold());
        return;
    }

    let state = text(&status["state"]);
    let indicator = match state.as_str() {
        "ready" => "■".green().bold(),
        "uninitialized" | "bootstrapping" => "■".yellow().bold(),
        _ => "■".cyan().bold(),
    };
    println!(
        "{indicator} tandem v{} | {} | peer {}",
        env!("CARGO_PKG_VERSION"),
        state.to_uppercase().bold(),
        text_or(&status["remote_url"], &text(&status["peer"])),
    );
    println!(
        "  head {} | pending {} changed, {} removed{}",
        text_or(&status["head"], "(none)"),
        status["pending_changed"],
        status["pending_removed"],
        if status["pull_requested"] == json!(true) {
            ", pull requested"
        } else {
            ""
        },
    );

    let stats = &status["stats"];
    let rows: Vec<CounterRow> = [
        ("events", &stats["events"]),
        ("cycles", &stats["cycles"]),
        ("commits", &stats["commits"]),
        ("pulls", &stats["pulls"]),
        ("notifications", &stats["notifications"]),
        ("notify failures", &stats["notify_failures"]),
        ("command failures", &stats["command_failures"]),
        ("last cycle", &stats["last_cycle"]),
        ("last cycle at", &stats["last_cycle_at"]),
    ]
    .into_iter()
    .map(|(name, value)| CounterRow {
        name,
        value: text_or(value, "-"),
    })
    .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_or(value: &Value, fallback: &str) -> String {
    match text(value) {
        s if s.is_empty() => fallback.to_string(),
        s => s,
    }
}
