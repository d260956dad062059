//! Paths touched since the last commit cycle began.
//!
//! The set is owned by the sync loop; `record` and `drain` both take
//! `&mut self`, so a drain can never interleave with a record.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::types::{EventKind, RelPath, WatchEvent};

/// Accumulated `changed` / `removed` paths.
///
/// A path lives in at most one of the two sets; the latest event for it
/// decides which.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changed: BTreeSet<RelPath>,
    removed: BTreeSet<RelPath>,
}

/// What a commit cycle takes out of a [`ChangeSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainedChanges {
    pub changed: Vec<RelPath>,
    pub removed: Vec<RelPath>,
}

impl DrainedChanges {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed.len() + self.removed.len()
    }
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: RelPath, kind: EventKind) {
        match kind {
            EventKind::Added | EventKind::Changed => {
                self.removed.remove(&path);
                self.changed.insert(path);
            }
            EventKind::Removed => {
                self.changed.remove(&path);
                self.removed.insert(path);
            }
        }
    }

    pub fn record_event(&mut self, event: WatchEvent) {
        self.record(event.path, event.kind);
    }

    /// Takes every recorded path, leaving the set empty.
    pub fn drain(&mut self) -> DrainedChanges {
        DrainedChanges {
            changed: std::mem::take(&mut self.changed).into_iter().collect(),
            removed: std::mem::take(&mut self.removed).into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn changed_len(&self) -> usize {
        self.changed.len()
    }

    pub fn removed_len(&self) -> usize {
        self.removed.len()
    }
}
