pub use crate::abi::CONTENT_HASH_BYTES;
pub use crate::abi::PythonAbi;
pub use crate::abi::UNKNOWN_TYPE_ID;

pub use crate::builder::GraphBuilder;
pub use crate::builder::DEFAULT_MAX_OBJECT_SIZE;

pub use crate::diff::compare;
pub use crate::diff::compare_opt;
pub use crate::diff::DiffSet;

pub use crate::graph::ObjectGraph;
pub use crate::graph::ObjectNode;

pub use crate::manager::SnapshotManager;

pub use crate::plugin::load_abi;
pub use crate::plugin::load_reader;

pub use crate::pool::TypePool;

pub use crate::reader::MemRegion;
pub use crate::reader::ProcessReader;

pub use crate::snapshot::Snapshot;
pub use crate::snapshot::SnapshotHeader;

pub use crate::Error;
