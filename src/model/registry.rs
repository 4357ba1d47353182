use std::{
    collections::{hash_map::Entry, HashMap},
    hash::Hash,
    sync::Arc,
};

use parking_lot::RwLock;

/// A concurrent map from key to shared per-key state.
///
/// The registry lock is only held long enough to look up or insert an
/// entry.  Each entry carries its own locks, so work on one key never
/// waits on work for another.
pub struct Registry<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing entry, or stores and returns a new one.
    /// `create` only runs if no entry exists.
    pub fn get_or_create_with(&self, key: K, create: impl FnOnce() -> V) -> Arc<V> {
        if let Some(existing) = self.get(key) {
            return existing;
        }
        match self.entries.write().entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(Arc::new(create())).clone(),
        }
    }

    pub fn get(&self, key: K) -> Option<Arc<V>> {
        self.entries.read().get(&key).cloned()
    }

    pub fn delete(&self, key: K) -> Option<Arc<V>> {
        self.entries.write().remove(&key)
    }

    /// Removes the entry for `key` only if it is still `expected`.
    /// Used when an older owner tears down after a newer entry
    /// has replaced it.
    pub fn delete_if_same(&self, key: K, expected: &Arc<V>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().copied().collect()
    }
}

impl<K, V> Registry<K, V>
where
    K: Copy + Eq + Hash,
    V: Default,
{
    pub fn get_or_create(&self, key: K) -> Arc<V> {
        self.get_or_create_with(key, V::default)
    }
}
