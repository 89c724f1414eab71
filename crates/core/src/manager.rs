//! Bounded most-recent-first snapshot retention.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::snapshot::Snapshot;

pub const DEFAULT_MAX_SNAPSHOTS: usize = 5;

/// Holds up to `max_snapshots` generations, most recent at index 0.
///
/// Snapshots are handed out as `Arc`s, so a consumer can keep diffing a
/// generation after retention has evicted it. All accessors serialize on one
/// internal mutex; the snapshots themselves are immutable.
pub struct SnapshotManager {
    snapshots: Mutex<VecDeque<Arc<Snapshot>>>,
    max_snapshots: usize,
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SNAPSHOTS)
    }
}

impl SnapshotManager {
    /// Creates a manager retaining `max_snapshots` generations (coerced up
    /// to at least 1).
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::new()),
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Pushes `snapshot` as the newest generation, evicting the oldest when
    /// at capacity.
    pub fn add(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() >= self.max_snapshots {
            snapshots.pop_back();
            debug!("evicted oldest snapshot to stay within {}", self.max_snapshots);
        }
        snapshots.push_front(Arc::clone(&snapshot));
        snapshot
    }

    /// Returns generation `index`, 0 being the most recent.
    pub fn get(&self, index: usize) -> Option<Arc<Snapshot>> {
        self.snapshots.lock().get(index).cloned()
    }

    /// Equivalent to `get(0)`.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.snapshots.lock().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ObjectGraph;

    fn snapshot(epoch_ms: u64) -> Snapshot {
        Snapshot::new(epoch_ms, 3, 10, ObjectGraph::new())
    }

    #[test]
    fn zero_capacity_is_coerced_to_one() {
        let manager = SnapshotManager::new(0);
        assert_eq!(manager.max_snapshots(), 1);

        manager.add(snapshot(1));
        manager.add(snapshot(2));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.latest().unwrap().header().epoch_ms, 2);
    }

    #[test]
    fn latest_is_the_last_added() {
        let manager = SnapshotManager::default();
        manager.add(snapshot(1));
        let added = manager.add(snapshot(2));
        assert!(Arc::ptr_eq(&manager.latest().unwrap(), &added));
    }

    #[test]
    fn retention_evicts_the_oldest() {
        let manager = SnapshotManager::new(2);
        manager.add(snapshot(1));
        manager.add(snapshot(2));
        manager.add(snapshot(3));

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.get(0).unwrap().header().epoch_ms, 3);
        assert_eq!(manager.get(1).unwrap().header().epoch_ms, 2);
        assert!(manager.get(2).is_none());
    }

    #[test]
    fn count_never_exceeds_capacity() {
        let manager = SnapshotManager::new(3);
        for epoch in 0..10 {
            manager.add(snapshot(epoch));
            assert!(manager.len() <= manager.max_snapshots());
        }
    }

    #[test]
    fn consumers_outlive_eviction() {
        let manager = SnapshotManager::new(1);
        let first = manager.add(snapshot(1));
        manager.add(snapshot(2));

        // Evicted from the manager but still alive through our Arc.
        assert_eq!(first.header().epoch_ms, 1);
        assert_eq!(manager.latest().unwrap().header().epoch_ms, 2);
    }
}
