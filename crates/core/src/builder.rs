//! Two-phase acquisition of an [`ObjectGraph`] from a live target.
//!
//! Phase A walks candidate addresses through the target's memory regions at
//! pointer alignment and validates each against the decoder. Phase B seeds a
//! breadth-first traversal from the decoder's well-known roots and follows
//! reference edges, picking up objects the heuristic scan could not see.
//! Both phases share one processed-address set, so no address is validated
//! twice and the traversal terminates.

use std::collections::VecDeque;

use fxhash::FxHashSet;
use log::{debug, info};

use crate::abi::{PythonAbi, CONTENT_HASH_BYTES, UNKNOWN_TYPE_ID};
use crate::graph::{ObjectGraph, ObjectNode};
use crate::reader::{MemRegion, ProcessReader};
use crate::Error;

/// Upper bound on a plausible object size. Anything larger is treated as a
/// scan false-positive and rejected.
pub const DEFAULT_MAX_OBJECT_SIZE: u32 = 100 * 1024 * 1024;

/// Builds an [`ObjectGraph`] from a reader and a decoder.
///
/// # Examples
///
/// ```
/// use heapscope_core::prelude::*;
/// use heapscope_core::testing::{InMemoryReader, ScriptedAbi};
///
/// let mut reader = InMemoryReader::new();
/// reader.add_region(MemRegion::new(0x1000, 0x1100, MemRegion::READ, None));
/// reader.load_head(0x1000, 1, 0x9000);
///
/// let abi = ScriptedAbi::new(3, 10);
/// abi.define_type(0x9000, "list");
/// abi.define_object(0x1000, 64, 0, &[0x2000]);
///
/// let graph = GraphBuilder::new().build(&reader, &abi).unwrap();
/// assert!(graph.contains(0x1000));
/// ```
pub struct GraphBuilder {
    regions: Vec<MemRegion>,
    max_object_size: u32,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        GraphBuilder::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }

    /// Restricts the heuristic scan to an explicit region list instead of
    /// querying the reader.
    #[must_use]
    pub fn regions(mut self, regions: Vec<MemRegion>) -> Self {
        self.regions = regions;
        self
    }

    /// Overrides the suspicious-size clamp
    /// ([`DEFAULT_MAX_OBJECT_SIZE`]).
    #[must_use]
    pub fn max_object_size(mut self, limit: u32) -> Self {
        self.max_object_size = limit;
        self
    }

    /// Runs both acquisition phases and returns the deduplicated graph.
    ///
    /// Partial reads and undecodable candidates are skipped; the only fatal
    /// condition is a decoder reporting a zero head size.
    pub fn build(
        self,
        reader: &dyn ProcessReader,
        abi: &dyn PythonAbi,
    ) -> Result<ObjectGraph, Error> {
        let head_size = abi.head_size();
        if head_size == 0 {
            return Err(Error::ZeroHeadSize);
        }

        let regions = if self.regions.is_empty() {
            reader.regions()
        } else {
            self.regions
        };
        let alignment = std::mem::size_of::<usize>() as u64;

        let mut nodes = ObjectGraph::new();
        let mut processed = FxHashSet::<u64>::default();
        let mut head = vec![0_u8; head_size];

        debug!(
            "scan start: {} regions, head size {}, alignment {}",
            regions.len(),
            head_size,
            alignment
        );

        for region in &regions {
            if !region.is_readable() {
                continue;
            }
            let mut p = region.start;
            while p
                .checked_add(head_size as u64)
                .map_or(false, |tail| tail <= region.end)
            {
                if !processed.contains(&p) {
                    if let Some(node) =
                        probe(p, reader, abi, &mut head, self.max_object_size)
                    {
                        processed.insert(p);
                        nodes.insert(node);
                    }
                }
                p += alignment;
            }
        }

        info!("heuristic scan found {} objects", nodes.len());

        // Roots enter the queue unconditionally: a root the heuristic scan
        // already found still needs its references expanded. `processed`
        // only guards against re-probing.
        let mut queue = VecDeque::new();
        for root in abi.bfs_roots(reader).into_iter().collect::<FxHashSet<_>>() {
            processed.insert(root);
            queue.push_back(root);
        }

        let mut expanded = 0_usize;
        while let Some(addr) = queue.pop_front() {
            if let Some(node) = nodes.get(addr) {
                for r in &node.refs {
                    if processed.insert(*r) {
                        queue.push_back(*r);
                    }
                }
                continue;
            }

            // Validation failures leave the address marked processed, which
            // is what breaks reference cycles through unreadable objects.
            let Some(node) = probe(addr, reader, abi, &mut head, self.max_object_size)
            else {
                continue;
            };

            for r in &node.refs {
                if processed.insert(*r) {
                    queue.push_back(*r);
                }
            }
            nodes.insert(node);
            expanded += 1;
        }

        info!(
            "bfs expansion added {} objects, total {}",
            expanded,
            nodes.len()
        );
        Ok(nodes)
    }
}

/// Validates the candidate at `addr` and assembles its node.
///
/// The steps mirror the acquisition contract: readable head, non-zero type
/// pointer, confirmed type object, resolvable type ID, plausible size.
fn probe(
    addr: u64,
    reader: &dyn ProcessReader,
    abi: &dyn PythonAbi,
    head: &mut [u8],
    max_object_size: u32,
) -> Option<ObjectNode> {
    if !reader.read(addr, head) {
        return None;
    }

    let type_addr = abi.ob_type_from_head(head);
    if type_addr == 0 {
        return None;
    }
    if !abi.is_type_object(type_addr, reader) {
        return None;
    }

    let type_id = abi.type_id_from_type_addr(type_addr, reader);
    if type_id == UNKNOWN_TYPE_ID {
        return None;
    }

    let size = abi.object_size(addr, type_addr, reader);
    if size == 0 || size > max_object_size as usize {
        debug!("rejecting candidate at {:#x}: suspicious size {}", addr, size);
        return None;
    }

    let flags = abi.object_flags(addr, head, reader);
    let refs = abi.references(addr, type_addr, reader);
    let content_hash = abi.content_hash(addr, size, reader, CONTENT_HASH_BYTES);

    Some(ObjectNode::new(
        addr,
        type_id,
        size as u32,
        flags,
        refs,
        content_hash,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryReader, ScriptedAbi};

    #[test]
    fn zero_head_size_is_fatal() {
        let reader = InMemoryReader::new();
        let abi = ScriptedAbi::new(3, 10).with_head_size(0);

        let err = GraphBuilder::new().build(&reader, &abi).unwrap_err();
        assert!(matches!(err, Error::ZeroHeadSize));
    }

    #[test]
    fn empty_region_list_builds_an_empty_graph() {
        let reader = InMemoryReader::new();
        let abi = ScriptedAbi::new(3, 10);

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn unreadable_region_probes_nothing() {
        let mut reader = InMemoryReader::new();
        reader.add_region(MemRegion::new(0x1000, 0x1100, MemRegion::READ, None));

        let abi = ScriptedAbi::new(3, 10);

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();
        assert!(graph.is_empty());
        // Every read failed, so the decoder never saw a head buffer.
        assert_eq!(abi.ob_type_probes(), 0);
    }

    #[test]
    fn scan_finds_aligned_objects() {
        let mut reader = InMemoryReader::new();
        reader.add_region(MemRegion::new(0x1000, 0x1100, MemRegion::READ, None));
        reader.load_head(0x1000, 1, 0x9000);
        reader.load_head(0x1040, 2, 0x9000);

        let abi = ScriptedAbi::new(3, 10);
        abi.define_type(0x9000, "dict");
        abi.define_object(0x1000, 48, 0, &[0x1040]);
        abi.define_object(0x1040, 48, 0, &[]);

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get(0x1000).unwrap().refs, vec![0x1040]);
        assert!(graph.iter().all(|(addr, node)| *addr == node.addr));
    }

    #[test]
    fn suspicious_sizes_are_rejected() {
        let mut reader = InMemoryReader::new();
        reader.add_region(MemRegion::new(0x1000, 0x1100, MemRegion::READ, None));
        reader.load_head(0x1000, 1, 0x9000); // size 0
        reader.load_head(0x1040, 1, 0x9000); // size over the clamp

        let abi = ScriptedAbi::new(3, 10);
        abi.define_type(0x9000, "bytes");
        abi.define_object(0x1000, 0, 0, &[]);
        abi.define_object(0x1040, DEFAULT_MAX_OBJECT_SIZE as usize + 1, 0, &[]);

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn max_object_size_is_a_knob() {
        let mut reader = InMemoryReader::new();
        reader.add_region(MemRegion::new(0x1000, 0x1040, MemRegion::READ, None));
        reader.load_head(0x1000, 1, 0x9000);

        let abi = ScriptedAbi::new(3, 10);
        abi.define_type(0x9000, "bytes");
        abi.define_object(0x1000, 4096, 0, &[]);

        let graph = GraphBuilder::new()
            .max_object_size(1024)
            .build(&reader, &abi)
            .unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn non_readable_regions_are_not_scanned() {
        let mut reader = InMemoryReader::new();
        reader.add_region(MemRegion::new(0x1000, 0x1040, MemRegion::EXEC, None));
        reader.load_head(0x1000, 1, 0x9000);

        let abi = ScriptedAbi::new(3, 10);
        abi.define_type(0x9000, "dict");
        abi.define_object(0x1000, 32, 0, &[]);

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();
        assert!(graph.is_empty());
        assert_eq!(abi.ob_type_probes(), 0);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let mut reader = InMemoryReader::new();
        reader.add_region(MemRegion::new(0x1000, 0x1040, MemRegion::READ, None));
        reader.load_head(0x1000, 1, 0xdead);

        let abi = ScriptedAbi::new(3, 10);
        // 0xdead is never defined as a type.

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn bfs_expands_from_roots_outside_scanned_regions() {
        let mut reader = InMemoryReader::new();
        // No scannable regions at all; everything hangs off the root.
        reader.load_head(0x2000, 1, 0x9000);
        reader.load_head(0x3000, 1, 0x9000);

        let abi = ScriptedAbi::new(3, 10);
        abi.define_type(0x9000, "module");
        abi.define_object(0x2000, 32, 0, &[0x3000]);
        abi.define_object(0x3000, 32, 0, &[0x2000]); // cycle back
        abi.add_root(0x2000);

        let graph = GraphBuilder::new()
            .regions(Vec::new())
            .build(&reader, &abi)
            .unwrap();

        assert_eq!(graph.len(), 2);
        assert!(graph.contains(0x2000));
        assert!(graph.contains(0x3000));
    }

    #[test]
    fn bfs_follows_refs_of_scanned_nodes() {
        let mut reader = InMemoryReader::new();
        // 0x1000 lives in a scanned region and points at 0x7000, which does
        // not; only the BFS pass can pick 0x7000 up.
        reader.add_region(MemRegion::new(0x1000, 0x1020, MemRegion::READ, None));
        reader.load_head(0x1000, 1, 0x9000);
        reader.load_head(0x7000, 1, 0x9000);

        let abi = ScriptedAbi::new(3, 10);
        abi.define_type(0x9000, "list");
        abi.define_object(0x1000, 32, 0, &[0x7000]);
        abi.define_object(0x7000, 32, 0, &[]);
        abi.add_root(0x1000);

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();

        assert_eq!(graph.len(), 2);
        assert!(graph.contains(0x7000));
    }

    #[test]
    fn dangling_refs_survive_in_the_graph() {
        let mut reader = InMemoryReader::new();
        reader.load_head(0x2000, 1, 0x9000);

        let abi = ScriptedAbi::new(3, 10);
        abi.define_type(0x9000, "tuple");
        abi.define_object(0x2000, 32, 0, &[0xbad0]); // 0xbad0 is unreadable
        abi.add_root(0x2000);

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get(0x2000).unwrap().refs, vec![0xbad0]);
        assert!(!graph.contains(0xbad0));
    }

    #[test]
    fn unreadable_cycle_members_do_not_hang_the_bfs() {
        let reader = InMemoryReader::new();

        let abi = ScriptedAbi::new(3, 10);
        abi.add_root(0x2000); // nothing readable behind the root

        let graph = GraphBuilder::new().build(&reader, &abi).unwrap();
        assert!(graph.is_empty());
    }
}
