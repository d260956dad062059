//! Change-set classification and drain behaviour.

use rstest::rstest;
use tandem_core::{ChangeSet, EventKind, RelPath, WatchEvent};

fn paths(items: &[&str]) -> Vec<RelPath> {
    items.iter().map(|p| RelPath::from(*p)).collect()
}

// ---------------------------------------------------------------------------
// Last-writer-wins per path
// ---------------------------------------------------------------------------

#[rstest]
#[case(&[EventKind::Added], true)]
#[case(&[EventKind::Changed, EventKind::Changed], true)]
#[case(&[EventKind::Added, EventKind::Removed], false)]
#[case(&[EventKind::Removed, EventKind::Changed], true)]
#[case(&[EventKind::Changed, EventKind::Removed, EventKind::Added, EventKind::Removed], false)]
fn final_event_decides_classification(#[case] events: &[EventKind], #[case] ends_changed: bool) {
    let mut set = ChangeSet::new();
    for kind in events {
        set.record(RelPath::from("notes/todo.md"), *kind);
    }

    let drained = set.drain();
    let expected = paths(&["notes/todo.md"]);
    if ends_changed {
        assert_eq!(drained.changed, expected);
        assert!(drained.removed.is_empty());
    } else {
        assert!(drained.changed.is_empty());
        assert_eq!(drained.removed, expected);
    }
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

#[test]
fn drain_deduplicates_and_sorts() {
    let mut set = ChangeSet::new();
    for path in ["b.txt", "a.txt", "b.txt", "a.txt"] {
        set.record_event(WatchEvent::new(EventKind::Changed, path));
    }
    set.record_event(WatchEvent::new(EventKind::Removed, "c.txt"));

    let drained = set.drain();
    assert_eq!(drained.changed, paths(&["a.txt", "b.txt"]));
    assert_eq!(drained.removed, paths(&["c.txt"]));
    assert_eq!(drained.len(), 3);
}

#[test]
fn every_recorded_path_lands_in_exactly_one_drain() {
    let mut set = ChangeSet::new();
    set.record(RelPath::from("one"), EventKind::Changed);
    set.record(RelPath::from("two"), EventKind::Removed);
    let first = set.drain();

    // Recorded after the first drain: belongs to the next one only.
    set.record(RelPath::from("three"), EventKind::Added);
    let second = set.drain();
    let third = set.drain();

    assert_eq!(first.changed, paths(&["one"]));
    assert_eq!(first.removed, paths(&["two"]));
    assert_eq!(second.changed, paths(&["three"]));
    assert!(second.removed.is_empty());
    assert!(third.is_empty());
}

#[test]
fn counters_track_pending_paths() {
    let mut set = ChangeSet::new();
    assert!(set.is_empty());
    set.record(RelPath::from("a"), EventKind::Changed);
    set.record(RelPath::from("b"), EventKind::Removed);
    assert_eq!((set.changed_len(), set.removed_len()), (1, 1));
}
