#![forbid(unsafe_code)]

use super::{ProcessInfo, Snapshot};

/// Full-value difference between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// `current - previous`, ordered by creation time so that a parent
    /// appearing in the same tick as its child is seen first.
    pub started: Vec<ProcessInfo>,
    /// `previous - current`, in the same order.
    pub stopped: Vec<ProcessInfo>,
}

impl SnapshotDiff {
    pub fn between(previous: &Snapshot, current: &Snapshot) -> Self {
        let mut started: Vec<_> = current.difference(previous).cloned().collect();
        let mut stopped: Vec<_> = previous.difference(current).cloned().collect();
        started.sort_by_key(|p| (p.creation_time(), p.id()));
        stopped.sort_by_key(|p| (p.creation_time(), p.id()));
        Self { started, stopped }
    }

    /// Baseline for the next tick: `(current ∩ previous) ∪ started`.
    pub fn next_baseline(previous: &Snapshot, current: &Snapshot) -> Snapshot {
        let mut next: Snapshot = current.intersection(previous).cloned().collect();
        next.extend(current.difference(previous).cloned());
        next
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn info(id: u32, time: u64) -> ProcessInfo {
        ProcessInfo::new(id, 1, format!("/bin/p{id}")).with_creation_time(time)
    }

    #[test]
    fn recycled_id_shows_up_on_both_sides() {
        let previous: Snapshot = [info(5, 1), info(6, 1)].into_iter().collect();
        let current: Snapshot = [info(5, 9), info(6, 1)].into_iter().collect();
        let diff = SnapshotDiff::between(&previous, &current);
        assert_eq!(diff.started, vec![info(5, 9)]);
        assert_eq!(diff.stopped, vec![info(5, 1)]);
    }

    #[test]
    fn started_is_sorted_by_creation_time() {
        let previous = Snapshot::new();
        let current: Snapshot = [info(30, 3), info(10, 1), info(20, 2)].into_iter().collect();
        let diff = SnapshotDiff::between(&previous, &current);
        let ids: Vec<_> = diff.started.iter().map(ProcessInfo::id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    fn snapshot_strategy() -> impl Strategy<Value = Snapshot> {
        prop::collection::hash_set((1u32..20, 0u64..4), 0..30).prop_map(|entries| {
            entries.into_iter().map(|(id, time)| info(id, time)).collect()
        })
    }

    proptest! {
        #[test]
        fn started_and_stopped_are_disjoint(
            previous in snapshot_strategy(),
            current in snapshot_strategy(),
        ) {
            let diff = SnapshotDiff::between(&previous, &current);
            let started: HashSet<_> = diff.started.iter().cloned().collect();
            let stopped: HashSet<_> = diff.stopped.iter().cloned().collect();
            prop_assert!(started.is_disjoint(&stopped));
            prop_assert!(started.iter().all(|p| current.contains(p) && !previous.contains(p)));
            prop_assert!(stopped.iter().all(|p| previous.contains(p) && !current.contains(p)));
            prop_assert_eq!(SnapshotDiff::next_baseline(&previous, &current), current);
        }
    }
}
