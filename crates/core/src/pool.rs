//! Interning of type-name strings into compact integer IDs.

use fxhash::FxHashMap;
use parking_lot::RwLock;

#[derive(Default)]
struct Inner {
    by_name: FxHashMap<String, u32>,
    names: Vec<String>,
}

/// A bijective mapping between type names and dense `u32` IDs.
///
/// IDs are assigned from 0 in first-seen order and are stable for the
/// lifetime of the pool; they are never reused. Lookups of already interned
/// names only take the read lock, so concurrent readers do not serialize.
///
/// A pool is owned by its decoder instance, not shared globally.
#[derive(Default)]
pub struct TypePool {
    inner: RwLock<Inner>,
}

impl TypePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ID for `name`, interning it if unseen.
    pub fn intern(&self, name: &str) -> u32 {
        if let Some(id) = self.inner.read().by_name.get(name) {
            return *id;
        }

        let mut inner = self.inner.write();
        // Raced with another writer between the two locks.
        if let Some(id) = inner.by_name.get(name) {
            return *id;
        }
        let id = inner.names.len() as u32;
        inner.names.push(name.to_owned());
        inner.by_name.insert(name.to_owned(), id);
        id
    }

    /// Returns the ID for `name` without interning.
    pub fn get(&self, name: &str) -> Option<u32> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Returns the name interned under `id`.
    pub fn name(&self, id: u32) -> Option<String> {
        self.inner.read().names.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().names.is_empty()
    }

    /// Drops all entries. Only meaningful between runs (testing).
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_name.clear();
        inner.names.clear();
    }
}
