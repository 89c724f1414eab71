//! Structural comparison of two snapshots.

use fxhash::FxHashSet;
use log::debug;

use crate::snapshot::Snapshot;

/// Addresses classified by how they changed between two snapshots.
///
/// An address appears in at most one of `added`/`removed`. `type_changed`
/// and `content_changed` are mutually exclusive per address (first match
/// wins), but either may coexist with `references_structurally_changed`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffSet {
    pub added: Vec<u64>,
    pub removed: Vec<u64>,
    pub type_changed: Vec<u64>,
    pub content_changed: Vec<u64>,
    pub references_structurally_changed: Vec<u64>,
}

impl DiffSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.type_changed.is_empty()
            && self.content_changed.is_empty()
            && self.references_structurally_changed.is_empty()
    }
}

/// Compares two snapshots structurally.
///
/// Runs in O(|old| + |new|) expected time. Reference lists are compared as
/// unordered sets of addresses, so reordering or duplicating an edge is not
/// a structural change.
pub fn compare(old: &Snapshot, new: &Snapshot) -> DiffSet {
    let mut diff = DiffSet::default();

    let old_nodes = old.graph();
    let new_nodes = new.graph();

    for (addr, new_node) in new_nodes.iter() {
        let Some(old_node) = old_nodes.get(*addr) else {
            diff.added.push(*addr);
            continue;
        };

        if new_node.type_id != old_node.type_id {
            diff.type_changed.push(*addr);
        } else if new_node.content_hash != old_node.content_hash {
            diff.content_changed.push(*addr);
        }

        let old_refs: FxHashSet<u64> = old_node.refs.iter().copied().collect();
        let new_refs: FxHashSet<u64> = new_node.refs.iter().copied().collect();
        if old_refs != new_refs {
            diff.references_structurally_changed.push(*addr);
        }
    }

    for addr in old_nodes.addrs() {
        if !new_nodes.contains(addr) {
            diff.removed.push(addr);
        }
    }

    debug!(
        "diff: {} added, {} removed, {} type, {} content, {} refs",
        diff.added.len(),
        diff.removed.len(),
        diff.type_changed.len(),
        diff.content_changed.len(),
        diff.references_structurally_changed.len()
    );
    diff
}

/// [`compare`] over optional inputs; any missing side yields an empty diff.
pub fn compare_opt(old: Option<&Snapshot>, new: Option<&Snapshot>) -> DiffSet {
    match (old, new) {
        (Some(old), Some(new)) => compare(old, new),
        _ => DiffSet::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ObjectGraph, ObjectNode};

    fn snapshot(nodes: Vec<ObjectNode>) -> Snapshot {
        Snapshot::new(0, 3, 10, nodes.into_iter().collect())
    }

    fn sorted(mut addrs: Vec<u64>) -> Vec<u64> {
        addrs.sort_unstable();
        addrs
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        let make = || {
            snapshot(vec![
                ObjectNode::new(0x1000, 1, 32, 0, vec![0x2000], 10),
                ObjectNode::new(0x2000, 2, 64, 0, vec![], 20),
            ])
        };
        assert!(compare(&make(), &make()).is_empty());
    }

    #[test]
    fn everything_added_from_empty() {
        let empty = snapshot(vec![]);
        let full = snapshot(vec![
            ObjectNode::new(0x1000, 1, 32, 0, vec![], 1),
            ObjectNode::new(0x2000, 1, 32, 0, vec![], 2),
        ]);

        let diff = compare(&empty, &full);
        assert_eq!(sorted(diff.added), vec![0x1000, 0x2000]);
        assert!(diff.removed.is_empty());
        assert!(diff.type_changed.is_empty());
        assert!(diff.content_changed.is_empty());
        assert!(diff.references_structurally_changed.is_empty());
    }

    #[test]
    fn everything_removed_to_empty() {
        let empty = snapshot(vec![]);
        let full = snapshot(vec![
            ObjectNode::new(0x1000, 1, 32, 0, vec![], 1),
            ObjectNode::new(0x2000, 1, 32, 0, vec![], 2),
        ]);

        let diff = compare(&full, &empty);
        assert_eq!(sorted(diff.removed), vec![0x1000, 0x2000]);
        assert!(diff.added.is_empty());
        assert!(diff.type_changed.is_empty());
        assert!(diff.content_changed.is_empty());
        assert!(diff.references_structurally_changed.is_empty());
    }

    #[test]
    fn classifies_the_reference_scenario() {
        // Old: A(type 1, hash 10, refs {B}), B(type 2, hash 20).
        // New: A(type 1, hash 11, refs {B, C}), C(type 3, hash 30).
        let a = 0xa000;
        let b = 0xb000;
        let c = 0xc000;

        let old = snapshot(vec![
            ObjectNode::new(a, 1, 32, 0, vec![b], 10),
            ObjectNode::new(b, 2, 32, 0, vec![], 20),
        ]);
        let new = snapshot(vec![
            ObjectNode::new(a, 1, 32, 0, vec![b, c], 11),
            ObjectNode::new(c, 3, 32, 0, vec![], 30),
        ]);

        let diff = compare(&old, &new);
        assert_eq!(diff.added, vec![c]);
        assert_eq!(diff.removed, vec![b]);
        assert!(diff.type_changed.is_empty());
        assert_eq!(diff.content_changed, vec![a]);
        assert_eq!(diff.references_structurally_changed, vec![a]);
    }

    #[test]
    fn ref_order_and_duplicates_are_not_structural() {
        let old = snapshot(vec![ObjectNode::new(
            0x1000,
            1,
            32,
            0,
            vec![0x2000, 0x3000],
            7,
        )]);
        let new = snapshot(vec![ObjectNode::new(
            0x1000,
            1,
            32,
            0,
            vec![0x3000, 0x2000, 0x3000],
            7,
        )]);

        assert!(compare(&old, &new).is_empty());
    }

    #[test]
    fn type_change_shadows_content_change() {
        let old = snapshot(vec![ObjectNode::new(0x1000, 1, 32, 0, vec![], 10)]);
        let new = snapshot(vec![ObjectNode::new(0x1000, 2, 32, 0, vec![], 99)]);

        let diff = compare(&old, &new);
        assert_eq!(diff.type_changed, vec![0x1000]);
        assert!(diff.content_changed.is_empty());
    }

    #[test]
    fn type_change_and_ref_change_can_coexist() {
        let old = snapshot(vec![ObjectNode::new(0x1000, 1, 32, 0, vec![0x2000], 10)]);
        let new = snapshot(vec![ObjectNode::new(0x1000, 2, 32, 0, vec![], 10)]);

        let diff = compare(&old, &new);
        assert_eq!(diff.type_changed, vec![0x1000]);
        assert_eq!(diff.references_structurally_changed, vec![0x1000]);
    }

    #[test]
    fn missing_inputs_yield_an_empty_diff() {
        let s = snapshot(vec![ObjectNode::new(0x1000, 1, 32, 0, vec![], 1)]);
        assert!(compare_opt(None, Some(&s)).is_empty());
        assert!(compare_opt(Some(&s), None).is_empty());
        assert!(compare_opt(None, None).is_empty());
    }
}
