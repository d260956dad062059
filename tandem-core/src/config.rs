//! YAML configuration at `~/.tandem/config.yaml`.
//!
//! # API pattern
//!
//! Every function touching disk has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! A missing file is not an error: [`load_at`] returns [`SyncConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

pub const DEFAULT_HTTP_PORT: u16 = 3294;
pub const CONFIG_FILE: &str = "config.yaml";

// ---------------------------------------------------------------------------
// 1. Schema
// ---------------------------------------------------------------------------

/// Where filesystem events come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatcherConfig {
    /// In-process recursive watcher.
    #[default]
    Builtin,
    /// External process printing `"<kind> <path>"` lines; the sync root is
    /// appended as its last argument.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Daemon settings. Every field has a default, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Port the trigger listener binds and the peer is notified on.
    pub http_port: u16,
    /// Minimum time between the starts of two cycles.
    pub min_spacing_ms: u64,
    /// Settle delay between a cycle being scheduled and its body running.
    pub start_delay_ms: u64,
    pub notify_timeout_ms: u64,
    /// Upper bound for a single VCS command; `0` disables the bound.
    pub command_timeout_secs: u64,
    pub remote_name: String,
    pub branch: String,
    pub commit_message: String,
    pub baseline_message: String,
    pub vcs_program: String,
    /// Directory name whose events are never recorded.
    pub metadata_dir: String,
    pub author_name: String,
    pub author_email: String,
    /// Pull from the peer right after the baseline commit.
    pub pull_on_start: bool,
    pub watcher: WatcherConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            min_spacing_ms: 1000,
            start_delay_ms: 100,
            notify_timeout_ms: 5000,
            command_timeout_secs: 300,
            remote_name: "origin".to_string(),
            branch: "master".to_string(),
            commit_message: "autocommit".to_string(),
            baseline_message: "post-walk commit".to_string(),
            vcs_program: "git".to_string(),
            metadata_dir: ".git".to_string(),
            author_name: "tandem".to_string(),
            author_email: "tandem@localhost".to_string(),
            pull_on_start: true,
            watcher: WatcherConfig::Builtin,
        }
    }
}

impl SyncConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    /// Rejects values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_port == 0 {
            return Err(ConfigError::Invalid {
                field: "http_port",
                reason: "must be a fixed, non-zero port".to_string(),
            });
        }
        let non_empty = [
            ("remote_name", &self.remote_name),
            ("branch", &self.branch),
            ("commit_message", &self.commit_message),
            ("baseline_message", &self.baseline_message),
            ("vcs_program", &self.vcs_program),
            ("metadata_dir", &self.metadata_dir),
        ];
        for (field, value) in non_empty {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if let WatcherConfig::Command { program, .. } = &self.watcher {
            if program.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "watcher.program",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 2. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.tandem/`, pure, no I/O.
pub fn tandem_dir_at(home: &Path) -> PathBuf {
    home.join(".tandem")
}

/// `<home>/.tandem/config.yaml`, pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    tandem_dir_at(home).join(CONFIG_FILE)
}

/// `config_path_at` convenience wrapper.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_path_at(&home()?))
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.tandem/config.yaml`.
///
/// Returns defaults if the file is absent, `ConfigError::Parse` (with path
/// and line context) if it is malformed.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let config: SyncConfig = if contents.trim().is_empty() {
        SyncConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?
    };
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save `config` to `<home>/.tandem/config.yaml`.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    let dir = tandem_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

    let yaml = to_yaml(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// Render `config` the way `save_at` writes it.
pub fn to_yaml(config: &SyncConfig) -> Result<String, ConfigError> {
    Ok(serde_yaml::to_string(config)?)
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
