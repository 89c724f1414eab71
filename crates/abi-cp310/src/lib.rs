//! Object-layout decoder for CPython 3.10 on 64-bit targets.
//!
//! All offsets below are the 3.10 `PyObject` / `PyTypeObject` /
//! `PyDictObject` field positions. The decoder reads nothing but target
//! memory handed to it through a [`ProcessReader`]; it keeps no handle to
//! the process.
//!
//! Builds both as an rlib for static linking and as a `cdylib` exposing the
//! `create_abi` entry point for the plugin loader.

use log::debug;

use heapscope_core::abi::{fnv1a32, PythonAbi, UNKNOWN_TYPE_ID};
use heapscope_core::pool::TypePool;
use heapscope_core::reader::ProcessReader;

/// `PyObject`: `ob_refcnt` at 0, `ob_type` at 8.
const OB_TYPE: u64 = 8;
/// `PyVarObject::ob_size`.
const OB_SIZE: u64 = 16;

/// `PyTypeObject` field offsets past the `PyVarObject` head.
const TP_NAME: u64 = 24;
const TP_BASICSIZE: u64 = 32;
const TP_ITEMSIZE: u64 = 40;
const TP_FLAGS: u64 = 168;

/// `PyListObject::ob_item` (pointer to the element array).
const LIST_OB_ITEM: u64 = 24;
/// `PyTupleObject::ob_item` (inline element array).
const TUPLE_OB_ITEM: u64 = 24;

/// `PyDictObject` field offsets.
const DICT_MA_USED: u64 = 16;
const DICT_MA_KEYS: u64 = 32;
const DICT_MA_VALUES: u64 = 40;

/// `PyDictKeysObject` field offsets (3.10 layout).
const DK_SIZE: u64 = 8;
const DK_NENTRIES: u64 = 32;
const DK_INDICES: u64 = 40;
/// `PyDictKeyEntry` is `{me_hash, me_key, me_value}`.
const DK_ENTRY_SIZE: u64 = 24;

/// `tp_flags` bits (subset relevant here).
const PY_TPFLAGS_HAVE_GC: u64 = 1 << 14;
const PY_TPFLAGS_LIST_SUBCLASS: u64 = 1 << 25;
const PY_TPFLAGS_TUPLE_SUBCLASS: u64 = 1 << 26;
const PY_TPFLAGS_DICT_SUBCLASS: u64 = 1 << 29;
const PY_TPFLAGS_TYPE_SUBCLASS: u64 = 1 << 31;

/// Longest `tp_name` we will copy out of the target.
const MAX_TYPE_NAME: usize = 128;

/// Upper bound on container cardinalities; anything larger is treated as a
/// misparse rather than walked.
const MAX_CONTAINER_ITEMS: i64 = 1 << 24;

/// Decoder for the CPython 3.10 ABI.
///
/// Interpreter-state roots cannot be discovered without symbol lookup,
/// which is the embedder's job; inject them with
/// [`with_roots`](Cp310Abi::with_roots) and the builder will seed its
/// traversal from there.
pub struct Cp310Abi {
    roots: Vec<u64>,
    pool: TypePool,
}

impl Default for Cp310Abi {
    fn default() -> Self {
        Self::new()
    }
}

impl Cp310Abi {
    pub fn new() -> Self {
        Self {
            roots: Vec::new(),
            pool: TypePool::new(),
        }
    }

    /// Sets the addresses handed out by
    /// [`bfs_roots`](PythonAbi::bfs_roots), typically the module table,
    /// builtins and sys dict located via the target's symbols.
    #[must_use]
    pub fn with_roots(mut self, roots: Vec<u64>) -> Self {
        self.roots = roots;
        self
    }

    fn read_u64(&self, reader: &dyn ProcessReader, addr: u64) -> Option<u64> {
        let mut buf = [0_u8; 8];
        reader.read(addr, &mut buf).then(|| u64::from_le_bytes(buf))
    }

    fn read_i64(&self, reader: &dyn ProcessReader, addr: u64) -> Option<i64> {
        self.read_u64(reader, addr).map(|v| v as i64)
    }

    /// Reads the `tp_name` C string of the type object at `type_addr`.
    fn read_type_name(&self, type_addr: u64, reader: &dyn ProcessReader) -> String {
        let Some(name_ptr) = self.read_u64(reader, type_addr + TP_NAME) else {
            return "<err:type head unreadable>".to_owned();
        };
        if name_ptr == 0 {
            return "<null>".to_owned();
        }

        let mut buf = [0_u8; MAX_TYPE_NAME];
        if !read_prefix(reader, name_ptr, &mut buf) {
            return "<err:name unreadable>".to_owned();
        }

        let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        let bytes = &buf[..len];
        if bytes.is_empty() || !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return "<err:name malformed>".to_owned();
        }

        // Qualified names like `collections.OrderedDict` keep only the
        // final component, matching what `type().__name__` shows.
        let name = std::str::from_utf8(bytes).expect("ascii checked above");
        name.rsplit('.').next().unwrap_or(name).to_owned()
    }

    fn list_refs(&self, obj_addr: u64, reader: &dyn ProcessReader) -> Vec<u64> {
        let Some(len) = self.read_i64(reader, obj_addr + OB_SIZE) else {
            return Vec::new();
        };
        if !(0..=MAX_CONTAINER_ITEMS).contains(&len) {
            return Vec::new();
        }
        let Some(items) = self.read_u64(reader, obj_addr + LIST_OB_ITEM) else {
            return Vec::new();
        };
        if items == 0 {
            return Vec::new();
        }
        self.read_pointer_array(reader, items, len as usize)
    }

    fn tuple_refs(&self, obj_addr: u64, reader: &dyn ProcessReader) -> Vec<u64> {
        let Some(len) = self.read_i64(reader, obj_addr + OB_SIZE) else {
            return Vec::new();
        };
        if !(0..=MAX_CONTAINER_ITEMS).contains(&len) {
            return Vec::new();
        }
        self.read_pointer_array(reader, obj_addr + TUPLE_OB_ITEM, len as usize)
    }

    fn dict_refs(&self, obj_addr: u64, reader: &dyn ProcessReader) -> Vec<u64> {
        let Some(keys_addr) = self.read_u64(reader, obj_addr + DICT_MA_KEYS) else {
            return Vec::new();
        };
        if keys_addr == 0 {
            return Vec::new();
        }

        let (Some(dk_size), Some(dk_nentries)) = (
            self.read_i64(reader, keys_addr + DK_SIZE),
            self.read_i64(reader, keys_addr + DK_NENTRIES),
        ) else {
            return Vec::new();
        };
        if dk_size <= 0 || dk_size > MAX_CONTAINER_ITEMS || dk_size.count_ones() != 1 {
            return Vec::new();
        }
        if dk_nentries < 0 || dk_nentries > dk_size {
            return Vec::new();
        }

        // The index vector is sized by the table: 1/2/4/8 bytes per slot.
        let index_size: u64 = match dk_size {
            0..=0xff => 1,
            0x100..=0xffff => 2,
            0x1_0000..=0xffff_ffff => 4,
            _ => 8,
        };
        let entries_addr = keys_addr + DK_INDICES + dk_size as u64 * index_size;

        let split_values = self
            .read_u64(reader, obj_addr + DICT_MA_VALUES)
            .filter(|v| *v != 0);

        let mut refs = Vec::new();
        for i in 0..dk_nentries as u64 {
            let entry = entries_addr + i * DK_ENTRY_SIZE;
            let Some(key) = self.read_u64(reader, entry + 8) else {
                return refs;
            };
            if key != 0 {
                refs.push(key);
            }
            // Combined tables carry the value in the entry; split tables
            // keep values in ma_values, handled below.
            if split_values.is_none() {
                if let Some(value) = self.read_u64(reader, entry + 16) {
                    if value != 0 {
                        refs.push(value);
                    }
                }
            }
        }

        if let Some(values_addr) = split_values {
            if let Some(used) = self.read_i64(reader, obj_addr + DICT_MA_USED) {
                if (0..=MAX_CONTAINER_ITEMS).contains(&used) {
                    refs.extend(self.read_pointer_array(reader, values_addr, used as usize));
                }
            }
        }

        refs
    }

    fn read_pointer_array(
        &self,
        reader: &dyn ProcessReader,
        addr: u64,
        len: usize,
    ) -> Vec<u64> {
        let mut buf = vec![0_u8; len * 8];
        if !reader.read(addr, &mut buf) {
            return Vec::new();
        }
        buf.chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("chunked by 8")))
            .filter(|p| *p != 0)
            .collect()
    }
}

impl PythonAbi for Cp310Abi {
    fn head_size(&self) -> usize {
        16
    }

    fn ob_type_from_head(&self, head: &[u8]) -> u64 {
        if head.len() < 16 {
            return 0;
        }
        u64::from_le_bytes(head[8..16].try_into().expect("length checked"))
    }

    fn is_type_object(&self, type_addr: u64, reader: &dyn ProcessReader) -> bool {
        // An object is a type iff its own type is `type` or a subclass of
        // it, which is what Py_TPFLAGS_TYPE_SUBCLASS on the metatype says.
        // `type` itself passes through the same walk (its metatype is
        // itself).
        let Some(meta) = self.read_u64(reader, type_addr + OB_TYPE) else {
            return false;
        };
        if meta == 0 {
            return false;
        }
        match self.read_u64(reader, meta + TP_FLAGS) {
            Some(meta_flags) => meta_flags & PY_TPFLAGS_TYPE_SUBCLASS != 0,
            None => false,
        }
    }

    fn type_name(&self, obj_addr: u64, reader: &dyn ProcessReader) -> String {
        let mut head = [0_u8; 16];
        if !reader.read(obj_addr, &mut head) {
            return "<err:head unreadable>".to_owned();
        }
        let type_addr = self.ob_type_from_head(&head);
        if type_addr == 0 {
            return "<null>".to_owned();
        }
        self.read_type_name(type_addr, reader)
    }

    fn type_id_from_type_addr(&self, type_addr: u64, reader: &dyn ProcessReader) -> u32 {
        let name = self.read_type_name(type_addr, reader);
        if name.starts_with('<') {
            return UNKNOWN_TYPE_ID;
        }
        self.pool.intern(&name)
    }

    fn object_size(&self, obj_addr: u64, type_addr: u64, reader: &dyn ProcessReader) -> usize {
        let (Some(basicsize), Some(itemsize)) = (
            self.read_i64(reader, type_addr + TP_BASICSIZE),
            self.read_i64(reader, type_addr + TP_ITEMSIZE),
        ) else {
            return 0;
        };
        if basicsize <= 0 || itemsize < 0 {
            return 0;
        }
        if itemsize == 0 {
            return basicsize as usize;
        }

        // Var-objects: negative ob_size encodes sign for int, count is abs.
        let Some(ob_size) = self.read_i64(reader, obj_addr + OB_SIZE) else {
            return 0;
        };
        let count = ob_size.unsigned_abs();
        if count > MAX_CONTAINER_ITEMS as u64 {
            return 0;
        }
        basicsize as usize + (count as usize) * (itemsize as usize)
    }

    fn object_flags(&self, _obj_addr: u64, head: &[u8], reader: &dyn ProcessReader) -> u32 {
        let type_addr = self.ob_type_from_head(head);
        if type_addr == 0 {
            return 0;
        }
        self.read_u64(reader, type_addr + TP_FLAGS)
            .map_or(0, |flags| flags as u32)
    }

    fn references(&self, obj_addr: u64, type_addr: u64, reader: &dyn ProcessReader) -> Vec<u64> {
        let Some(flags) = self.read_u64(reader, type_addr + TP_FLAGS) else {
            return Vec::new();
        };

        if flags & PY_TPFLAGS_TUPLE_SUBCLASS != 0 {
            self.tuple_refs(obj_addr, reader)
        } else if flags & PY_TPFLAGS_LIST_SUBCLASS != 0 {
            self.list_refs(obj_addr, reader)
        } else if flags & PY_TPFLAGS_DICT_SUBCLASS != 0 {
            self.dict_refs(obj_addr, reader)
        } else {
            // Other GC'd containers would need tp_traverse, which cannot run
            // out-of-process.
            if flags & PY_TPFLAGS_HAVE_GC != 0 {
                debug!(
                    "no reference walk for GC object at {:#x} (flags {:#x})",
                    obj_addr, flags
                );
            }
            Vec::new()
        }
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
        self.roots.clone()
    }

    fn version_string(&self) -> String {
        "CPython 3.10".to_owned()
    }

    fn major(&self) -> u32 {
        3
    }

    fn minor(&self) -> u32 {
        10
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

/// Reads as many leading bytes of `buf` as the target allows, shrinking the
/// window until a read succeeds. Returns `false` when not even one byte is
/// readable.
fn read_prefix(reader: &dyn ProcessReader, addr: u64, buf: &mut [u8]) -> bool {
    let mut len = buf.len();
    while len > 0 {
        if reader.read(addr, &mut buf[..len]) {
            return true;
        }
        len /= 2;
    }
    false
}

/// Plugin entry point; the caller takes ownership.
#[no_mangle]
pub extern "C" fn create_abi() -> *mut dyn PythonAbi {
    Box::into_raw(Box::new(Cp310Abi::new()))
}
