//! A library for taking out-of-process snapshots of a running CPython
//! interpreter's object graph, persisting them compactly and diffing
//! consecutive generations.
//!
//! The pipeline attaches a [`ProcessReader`] to a target pid, loads a
//! [`PythonAbi`] decoder matching the target's interpreter version, scans the
//! target's address space with [`GraphBuilder`] and wraps the resulting
//! [`ObjectGraph`] in a [`Snapshot`]. Snapshots are retained by a
//! [`SnapshotManager`] and compared with [`compare`].
//!
//! Both the reader and the decoder are capabilities consumed through narrow
//! traits: the reader knows how one operating system copies bytes out of a
//! foreign address space, the decoder knows the object layout of one CPython
//! version. Implementations can be linked statically or resolved at runtime
//! through the [`plugin`] module.
//!
//! # Building a graph
//!
//! The [`testing`] module provides deterministic in-memory implementations of
//! both capabilities, which double as documentation of the contracts:
//!
//! ```
//! use heapscope_core::prelude::*;
//! use heapscope_core::testing::{InMemoryReader, ScriptedAbi};
//!
//! let mut reader = InMemoryReader::new();
//! reader.add_region(MemRegion::new(0x1000, 0x1040, MemRegion::READ, None));
//! reader.load_head(0x1000, 1, 0x9000);
//!
//! let abi = ScriptedAbi::new(3, 10);
//! abi.define_type(0x9000, "dict");
//! abi.define_object(0x1000, 32, 0, &[]);
//!
//! let graph = GraphBuilder::new().build(&reader, &abi).unwrap();
//!
//! assert_eq!(graph.len(), 1);
//! assert_eq!(graph.get(0x1000).unwrap().size, 32);
//! ```
//!
//! # Snapshots and diffing
//!
//! ```
//! use heapscope_core::prelude::*;
//!
//! let mut old = ObjectGraph::new();
//! old.insert(ObjectNode::new(0x1000, 0, 32, 0, vec![], 123));
//!
//! let mut new = ObjectGraph::new();
//! new.insert(ObjectNode::new(0x1000, 0, 32, 0, vec![], 124));
//! new.insert(ObjectNode::new(0x2000, 1, 64, 0, vec![0x1000], 456));
//!
//! let old = Snapshot::new(1000, 3, 10, old);
//! let new = Snapshot::new(2000, 3, 10, new);
//!
//! let diff = compare(&old, &new);
//!
//! assert_eq!(diff.added, vec![0x2000]);
//! assert_eq!(diff.content_changed, vec![0x1000]);
//! assert!(diff.removed.is_empty());
//! ```

pub mod abi;
pub mod builder;
pub mod diff;
pub mod graph;
pub mod manager;
pub mod plugin;
pub mod pool;
pub mod prelude;
pub mod reader;
pub mod snapshot;
pub mod testing;

pub use crate::abi::{PythonAbi, UNKNOWN_TYPE_ID};
pub use crate::builder::GraphBuilder;
pub use crate::diff::{compare, compare_opt, DiffSet};
pub use crate::graph::{ObjectGraph, ObjectNode};
pub use crate::manager::SnapshotManager;
pub use crate::pool::TypePool;
pub use crate::reader::{MemRegion, ProcessReader};
pub use crate::snapshot::{Snapshot, SnapshotHeader};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("error while accessing snapshot file")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("error while encoding snapshot payload")]
    Encode {
        #[from]
        source: rmp_serde::encode::Error,
    },
    #[error("error while decoding snapshot payload")]
    Decode {
        #[from]
        source: rmp_serde::decode::Error,
    },
    #[error("snapshot payload does not declare its decompressed size")]
    UnknownFrameSize,
    #[error("snapshot payload decompressed to {actual} bytes, expected {expected}")]
    FrameSizeMismatch { expected: u64, actual: u64 },
    #[error("decoder reported a zero-length object head")]
    ZeroHeadSize,
    #[error("failed to load plugin `{name}`")]
    PluginLoad {
        name: String,
        #[source]
        source: libloading::Error,
    },
    #[error("plugin `{name}` does not export `{symbol}`")]
    PluginSymbol {
        name: String,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },
}
