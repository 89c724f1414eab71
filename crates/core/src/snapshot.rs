//! Immutable, timestamped object graphs and their on-disk format.
//!
//! A snapshot file is a fixed 20-byte little-endian header followed by a
//! zstd frame containing the msgpack-encoded node map. The frame declares
//! its decompressed size, so no separate length field is stored.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};

use crate::graph::ObjectGraph;
use crate::Error;

/// Size of the serialized [`SnapshotHeader`].
pub const HEADER_LEN: usize = 20;

/// Fixed metadata preceding the compressed node map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Wall-clock milliseconds at acquisition.
    pub epoch_ms: u64,
    pub py_major: u32,
    pub py_minor: u32,
    /// Number of nodes in the graph at serialization time.
    pub node_count: u32,
}

impl SnapshotHeader {
    fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.epoch_ms)?;
        out.write_u32::<LittleEndian>(self.py_major)?;
        out.write_u32::<LittleEndian>(self.py_minor)?;
        out.write_u32::<LittleEndian>(self.node_count)
    }

    fn read_from(input: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            epoch_ms: input.read_u64::<LittleEndian>()?,
            py_major: input.read_u32::<LittleEndian>()?,
            py_minor: input.read_u32::<LittleEndian>()?,
            node_count: input.read_u32::<LittleEndian>()?,
        })
    }
}

/// An object graph frozen together with its acquisition metadata.
///
/// Immutable after construction and deliberately not clonable; consumers
/// share snapshots through `Arc` (see [`crate::manager::SnapshotManager`]).
#[derive(Debug)]
pub struct Snapshot {
    header: SnapshotHeader,
    graph: ObjectGraph,
}

impl Snapshot {
    /// Freezes `graph` under the given metadata; `node_count` is derived.
    pub fn new(epoch_ms: u64, py_major: u32, py_minor: u32, graph: ObjectGraph) -> Self {
        let header = SnapshotHeader {
            epoch_ms,
            py_major,
            py_minor,
            node_count: graph.len() as u32,
        };
        Self { header, graph }
    }

    /// Like [`Snapshot::new`] with `epoch_ms` stamped from the wall clock.
    pub fn capture(py_major: u32, py_minor: u32, graph: ObjectGraph) -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::new(epoch_ms, py_major, py_minor, graph)
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    /// Writes the snapshot to `path` in the documented file format.
    pub fn serialize(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let payload = rmp_serde::to_vec(&self.graph)?;
        let compressed = zstd::bulk::compress(&payload, zstd::DEFAULT_COMPRESSION_LEVEL)?;

        let mut out = BufWriter::new(File::create(path.as_ref())?);
        self.header.write_to(&mut out)?;
        out.write_all(&compressed)?;
        out.flush()?;

        info!(
            "snapshot serialized to {}: {} nodes, {} bytes raw, {} compressed",
            path.as_ref().display(),
            self.header.node_count,
            payload.len(),
            compressed.len()
        );
        Ok(())
    }

    /// Reads a snapshot back from `path`.
    ///
    /// The returned header is taken verbatim from the file. A `node_count`
    /// that disagrees with the decoded map is reported but not fatal.
    pub fn deserialize(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut input = BufReader::new(File::open(path.as_ref())?);
        let header = SnapshotHeader::read_from(&mut input)?;

        let mut compressed = Vec::new();
        input.read_to_end(&mut compressed)?;

        let declared = zstd::zstd_safe::get_frame_content_size(&compressed)
            .map_err(|_| Error::UnknownFrameSize)?
            .ok_or(Error::UnknownFrameSize)?;
        let payload = zstd::bulk::decompress(&compressed, declared as usize)?;
        if payload.len() as u64 != declared {
            return Err(Error::FrameSizeMismatch {
                expected: declared,
                actual: payload.len() as u64,
            });
        }

        let graph: ObjectGraph = rmp_serde::from_slice(&payload)?;
        if graph.len() as u32 != header.node_count {
            warn!(
                "snapshot {}: header claims {} nodes, payload has {}",
                path.as_ref().display(),
                header.node_count,
                graph.len()
            );
        }

        Ok(Self { header, graph })
    }
}
