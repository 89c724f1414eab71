//! Deterministic in-memory doubles for the reader and decoder capabilities.
//!
//! These back the unit tests of this crate and of the plugin crates. The
//! reader serves reads out of byte blocks registered at fixed addresses; the
//! decoder resolves objects from scripted tables and parses the same 16-byte
//! little-endian `[refcnt, type_addr]` head the real CPython decoders do.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::abi::{fnv1a32, PythonAbi, UNKNOWN_TYPE_ID};
use crate::pool::TypePool;
use crate::reader::{MemRegion, ProcessReader};

/// A [`ProcessReader`] backed by in-process byte blocks.
///
/// Reads succeed only when the requested range is fully contained in one
/// registered block, mirroring the all-or-nothing contract of the real
/// readers. Unregistered addresses read as failures, like unmapped pages.
#[derive(Default)]
pub struct InMemoryReader {
    attached: Option<u32>,
    blocks: BTreeMap<u64, Vec<u8>>,
    regions: Vec<MemRegion>,
    fail_reads: bool,
    deny_attach: bool,
}

impl InMemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bytes` at `addr`. Blocks must not overlap.
    pub fn load(&mut self, addr: u64, bytes: &[u8]) {
        self.blocks.insert(addr, bytes.to_vec());
    }

    /// Registers a 16-byte object head `[refcnt, type_addr]` at `addr`.
    pub fn load_head(&mut self, addr: u64, refcnt: u64, type_addr: u64) {
        self.load_words(addr, &[refcnt, type_addr]);
    }

    /// Registers a run of little-endian `u64` words at `addr`.
    pub fn load_words(&mut self, addr: u64, words: &[u64]) {
        let mut bytes = Vec::with_capacity(words.len() * 8);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        self.load(addr, &bytes);
    }

    pub fn add_region(&mut self, region: MemRegion) {
        self.regions.push(region);
    }

    /// Makes every subsequent read fail, registered blocks included.
    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// Makes [`ProcessReader::attach`] report failure.
    pub fn deny_attach(&mut self, deny: bool) {
        self.deny_attach = deny;
    }

    pub fn attached_pid(&self) -> Option<u32> {
        self.attached
    }
}

impl ProcessReader for InMemoryReader {
    fn attach(&mut self, pid: u32) -> bool {
        if self.attached.is_some() {
            self.detach();
        }
        if self.deny_attach {
            return false;
        }
        self.attached = Some(pid);
        true
    }

    fn detach(&mut self) {
        self.attached = None;
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        if self.fail_reads {
            return false;
        }
        let len = buf.len() as u64;
        let Some((start, bytes)) = self.blocks.range(..=addr).next_back() else {
            return false;
        };
        let end = start + bytes.len() as u64;
        if addr + len > end {
            return false;
        }
        let offset = (addr - start) as usize;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        true
    }

    fn regions(&self) -> Vec<MemRegion> {
        self.regions.clone()
    }
}

struct ObjectSpec {
    size: usize,
    flags: u32,
    refs: Vec<u64>,
}

/// A [`PythonAbi`] whose answers come from scripted tables.
///
/// Types are registered with [`define_type`](ScriptedAbi::define_type) and
/// objects with [`define_object`](ScriptedAbi::define_object); anything else
/// decodes as malformed. The probe counter lets tests assert that the
/// builder never consulted the decoder on a failed read.
pub struct ScriptedAbi {
    major: u32,
    minor: u32,
    head_size: usize,
    types: RwLock<FxHashMap<u64, String>>,
    objects: RwLock<FxHashMap<u64, ObjectSpec>>,
    roots: RwLock<Vec<u64>>,
    pool: TypePool,
    ob_type_probes: AtomicUsize,
}

impl ScriptedAbi {
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            head_size: 16,
            types: RwLock::default(),
            objects: RwLock::default(),
            roots: RwLock::default(),
            pool: TypePool::new(),
            ob_type_probes: AtomicUsize::new(0),
        }
    }

    /// Overrides the reported head size (16 by default). A zero head size
    /// simulates a misconfigured decoder.
    #[must_use]
    pub fn with_head_size(mut self, head_size: usize) -> Self {
        self.head_size = head_size;
        self
    }

    /// Declares `type_addr` to be a type object named `name`.
    pub fn define_type(&self, type_addr: u64, name: &str) {
        self.types.write().insert(type_addr, name.to_owned());
    }

    /// Declares the object at `addr` with the given size, flags and
    /// outgoing references. The object's head bytes still have to be loaded
    /// into the reader for the builder to find it.
    pub fn define_object(&self, addr: u64, size: usize, flags: u32, refs: &[u64]) {
        self.objects.write().insert(
            addr,
            ObjectSpec {
                size,
                flags,
                refs: refs.to_vec(),
            },
        );
    }

    pub fn add_root(&self, addr: u64) {
        self.roots.write().push(addr);
    }

    /// How often [`PythonAbi::ob_type_from_head`] was consulted.
    pub fn ob_type_probes(&self) -> usize {
        self.ob_type_probes.load(Ordering::Relaxed)
    }
}

impl PythonAbi for ScriptedAbi {
    fn head_size(&self) -> usize {
        self.head_size
    }

    fn ob_type_from_head(&self, head: &[u8]) -> u64 {
        self.ob_type_probes.fetch_add(1, Ordering::Relaxed);
        if head.len() < 16 {
            return 0;
        }
        u64::from_le_bytes(head[8..16].try_into().unwrap())
    }

    fn is_type_object(&self, type_addr: u64, _reader: &dyn ProcessReader) -> bool {
        self.types.read().contains_key(&type_addr)
    }

    fn type_name(&self, obj_addr: u64, reader: &dyn ProcessReader) -> String {
        let mut head = vec![0_u8; self.head_size];
        if !reader.read(obj_addr, &mut head) {
            return "<err:head unreadable>".to_owned();
        }
        let type_addr = if head.len() < 16 {
            0
        } else {
            u64::from_le_bytes(head[8..16].try_into().unwrap())
        };
        match self.types.read().get(&type_addr) {
            Some(name) => name.clone(),
            None => "<err:unknown type>".to_owned(),
        }
    }

    fn type_id_from_type_addr(&self, type_addr: u64, _reader: &dyn ProcessReader) -> u32 {
        match self.types.read().get(&type_addr) {
            Some(name) => self.pool.intern(name),
            None => UNKNOWN_TYPE_ID,
        }
    }

    fn object_size(&self, obj_addr: u64, _type_addr: u64, _reader: &dyn ProcessReader) -> usize {
        self.objects.read().get(&obj_addr).map_or(0, |o| o.size)
    }

    fn object_flags(&self, obj_addr: u64, _head: &[u8], _reader: &dyn ProcessReader) -> u32 {
        self.objects.read().get(&obj_addr).map_or(0, |o| o.flags)
    }

    fn references(&self, obj_addr: u64, _type_addr: u64, _reader: &dyn ProcessReader) -> Vec<u64> {
        self.objects
            .read()
            .get(&obj_addr)
            .map_or_else(Vec::new, |o| o.refs.clone())
    }

    fn content_hash(
        &self,
        obj_addr: u64,
        size: usize,
        reader: &dyn ProcessReader,
        n_bytes: usize,
    ) -> u32 {
        let mut body = vec![0_u8; n_bytes.min(size)];
        if !reader.read(obj_addr, &mut body) {
            return 0;
        }
        fnv1a32(&body)
    }

    fn bfs_roots(&self, _reader: &dyn ProcessReader) -> Vec<u64> {
        self.roots.read().clone()
    }

    fn version_string(&self) -> String {
        format!("{}.{} (scripted)", self.major, self.minor)
    }

    fn major(&self) -> u32 {
        self.major
    }

    fn minor(&self) -> u32 {
        self.minor
    }

    fn type_id_by_name(&self, name: &str) -> u32 {
        self.pool.intern(name)
    }

    fn type_name_from_id(&self, type_id: u32) -> Option<String> {
        self.pool.name(type_id)
    }

    fn clear_type_pool(&self) {
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_served_from_contained_blocks_only() {
        let mut reader = InMemoryReader::new();
        reader.load(0x1000, &[1, 2, 3, 4]);

        let mut buf = [0_u8; 2];
        assert!(reader.read(0x1001, &mut buf));
        assert_eq!(buf, [2, 3]);

        // Crossing the end of the block fails.
        let mut buf = [0_u8; 4];
        assert!(!reader.read(0x1002, &mut buf));
        // Unregistered addresses fail.
        assert!(!reader.read(0x2000, &mut [0_u8; 1]));
    }

    #[test]
    fn fail_reads_overrides_registered_blocks() {
        let mut reader = InMemoryReader::new();
        reader.load(0x1000, &[1, 2, 3, 4]);
        reader.fail_reads(true);
        assert!(!reader.read(0x1000, &mut [0_u8; 1]));
    }

    #[test]
    fn reattach_replaces_the_previous_target() {
        let mut reader = InMemoryReader::new();
        assert!(reader.attach(100));
        assert!(reader.attach(200));
        assert_eq!(reader.attached_pid(), Some(200));
        reader.detach();
        reader.detach(); // idempotent
        assert_eq!(reader.attached_pid(), None);
    }

    #[test]
    fn scripted_abi_resolves_defined_types() {
        let mut reader = InMemoryReader::new();
        reader.load_head(0x1000, 1, 0x9000);

        let abi = ScriptedAbi::new(3, 10);
        abi.define_type(0x9000, "dict");

        assert!(abi.is_type_object(0x9000, &reader));
        assert_eq!(abi.type_name(0x1000, &reader), "dict");

        let id = abi.type_id_from_type_addr(0x9000, &reader);
        assert_ne!(id, UNKNOWN_TYPE_ID);
        assert_eq!(abi.type_name_from_id(id).as_deref(), Some("dict"));
    }

    #[test]
    fn scripted_abi_flags_unknown_types() {
        let reader = InMemoryReader::new();
        let abi = ScriptedAbi::new(3, 10);

        assert!(abi.type_name(0x1000, &reader).starts_with("<err"));
        assert_eq!(
            abi.type_id_from_type_addr(0xdead, &reader),
            UNKNOWN_TYPE_ID
        );
    }

    #[test]
    fn content_hash_covers_at_most_the_object_size() {
        let mut reader = InMemoryReader::new();
        reader.load(0x1000, &[7_u8; 8]);

        let abi = ScriptedAbi::new(3, 10);
        // size 8 caps the hash window below the requested 64 bytes
        assert_eq!(
            abi.content_hash(0x1000, 8, &reader, 64),
            fnv1a32(&[7_u8; 8])
        );
        // unreadable body hashes to 0
        assert_eq!(abi.content_hash(0x4000, 8, &reader, 64), 0);
    }
}
