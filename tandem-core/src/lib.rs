//! tandem core library: domain types, change set, configuration, errors.
//!
//! - [`types`]: newtypes and peer addressing
//! - [`change_set`]: [`ChangeSet`] of paths awaiting a commit cycle
//! - [`config`]: `~/.tandem/config.yaml` load / save
//! - [`error`]: [`ConfigError`], [`ParseError`]

pub mod change_set;
pub mod config;
pub mod error;
pub mod types;

pub use change_set::{ChangeSet, DrainedChanges};
pub use config::{SyncConfig, WatcherConfig};
pub use error::{ConfigError, ParseError};
pub use types::{
    EventKind, PeerAddress, PeerHost, RelPath, ResolvedPeer, Revision, WatchEvent,
};
