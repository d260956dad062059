//! Domain types shared by every tandem crate.
//!
//! Paths recorded from the watcher are relative to the sync root and kept as
//! strings (`RelPath`), because they are handed to the VCS verbatim.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Number of hex characters shown when a revision is logged.
pub const REVISION_DISPLAY_CHARS: usize = 10;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A path relative to the sync root, using `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelPath(pub String);

impl RelPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when any component of the path equals `dir_name`
    /// (e.g. `.git/index` or `vendor/lib/.git/HEAD` for `.git`).
    pub fn is_within(&self, dir_name: &str) -> bool {
        self.0.split('/').any(|component| component == dir_name)
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RelPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RelPath {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A commit identifier as printed by `rev-parse HEAD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(pub String);

impl Revision {
    /// Abbreviated form used in log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(REVISION_DISPLAY_CHARS)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Watch events
// ---------------------------------------------------------------------------

/// Classification of one filesystem event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Changed,
    Removed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => write!(f, "added"),
            EventKind::Changed => write!(f, "changed"),
            EventKind::Removed => write!(f, "removed"),
        }
    }
}

impl FromStr for EventKind {
    type Err = ParseError;

    /// Accepts both our own names and the names external watchers print
    /// (`created`, `modified`, `deleted`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "added" | "created" => Ok(EventKind::Added),
            "changed" | "modified" => Ok(EventKind::Changed),
            "removed" | "deleted" => Ok(EventKind::Removed),
            other => Err(ParseError::EventKind(other.to_string())),
        }
    }
}

/// A single event delivered by a watcher, already relative to the sync root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub path: RelPath,
}

impl WatchEvent {
    pub fn new(kind: EventKind, path: impl Into<RelPath>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Peer addressing
// ---------------------------------------------------------------------------

/// Literal host token meaning "use the address the peer connected from".
pub const AUTO_HOST: &str = "auto";

/// Host part of a peer address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerHost {
    Auto,
    Named(String),
}

impl fmt::Display for PeerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerHost::Auto => write!(f, "{AUTO_HOST}"),
            PeerHost::Named(host) => host.fmt(f),
        }
    }
}

/// `[user@]host:folder`, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub host: PeerHost,
    pub folder: String,
}

impl PeerAddress {
    /// Returns the concrete peer if the host is already known.
    pub fn resolved(&self) -> Option<ResolvedPeer> {
        match &self.host {
            PeerHost::Auto => None,
            PeerHost::Named(host) => Some(self.resolve(host.clone())),
        }
    }

    /// Pins the host, keeping user and folder.
    pub fn resolve(&self, host: impl Into<String>) -> ResolvedPeer {
        ResolvedPeer {
            user: self.user.clone(),
            host: host.into(),
            folder: self.folder.clone(),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}:{}", self.host, self.folder)
    }
}

impl FromStr for PeerAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::Peer(s.to_string());

        let (address, folder) = s.split_once(':').ok_or_else(invalid)?;
        if folder.is_empty() {
            return Err(invalid());
        }
        let (user, host) = match address.rsplit_once('@') {
            Some((user, host)) if !user.is_empty() => (Some(user.to_string()), host),
            Some(_) => return Err(invalid()),
            None => (None, address),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let host = if host.eq_ignore_ascii_case(AUTO_HOST) {
            PeerHost::Auto
        } else {
            PeerHost::Named(host.to_string())
        };

        Ok(PeerAddress {
            user,
            host,
            folder: folder.to_string(),
        })
    }
}

/// A peer whose host is known: the target of pulls and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPeer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub host: String,
    pub folder: String,
}

impl ResolvedPeer {
    /// Host as it must appear before a `:` separator. IPv6 literals are
    /// bracketed, otherwise their colons end the host early.
    pub fn bracketed_host(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// scp-style remote URL understood by `git remote add`.
    pub fn remote_url(&self) -> String {
        let host = self.bracketed_host();
        match &self.user {
            Some(user) => format!("{user}@{host}:{}", self.folder),
            None => format!("{host}:{}", self.folder),
        }
    }

    /// `[user@]host`, as passed to ssh.
    pub fn ssh_target(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
