//! The object graph: address-keyed nodes with outgoing reference edges.

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One object in the target's heap.
///
/// Serialized as a 6-element array in field order, so the on-wire record is
/// `[addr, type_id, size, flags, refs, content_hash]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectNode {
    /// Absolute address in the target; the graph key.
    pub addr: u64,
    /// Interned type identifier, resolvable through the decoder's type pool.
    pub type_id: u32,
    /// Byte size of the object.
    pub size: u32,
    /// Opaque flag bits from the decoder.
    pub flags: u32,
    /// Addresses of referenced objects. Order carries no meaning and
    /// duplicates are permitted; structural equality treats this as a set.
    pub refs: Vec<u64>,
    /// Hash of the object's first body bytes, for cheap change detection.
    pub content_hash: u32,
}

impl ObjectNode {
    pub fn new(
        addr: u64,
        type_id: u32,
        size: u32,
        flags: u32,
        refs: Vec<u64>,
        content_hash: u32,
    ) -> Self {
        Self {
            addr,
            type_id,
            size,
            flags,
            refs,
            content_hash,
        }
    }
}

/// A deduplicated object graph keyed by absolute address.
///
/// Edges are represented as addresses, not owning references; an address in
/// a node's `refs` may be absent from the graph (a dangling edge). The graph
/// is movable but deliberately not clonable, matching its role as the bulk
/// payload of a snapshot.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectGraph {
    nodes: FxHashMap<u64, ObjectNode>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `node` under its own address, replacing any previous entry.
    pub fn insert(&mut self, node: ObjectNode) {
        self.nodes.insert(node.addr, node);
    }

    pub fn get(&self, addr: u64) -> Option<&ObjectNode> {
        self.nodes.get(&addr)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.nodes.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &ObjectNode)> {
        self.nodes.iter()
    }

    pub fn addrs(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.keys().copied()
    }
}

impl FromIterator<ObjectNode> for ObjectGraph {
    fn from_iter<I: IntoIterator<Item = ObjectNode>>(iter: I) -> Self {
        let mut graph = ObjectGraph::new();
        for node in iter {
            graph.insert(node);
        }
        graph
    }
}
