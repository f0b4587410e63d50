// src/sync/rcu_map.rs

//! A read-mostly hash map built on [`ReadSkewedLock`]. Used for the RPC
//! client manager's `id -> ip` cache and for proclet-local maps.

use super::ReadSkewedLock;
use std::collections::HashMap;
use std::hash::Hash;

pub struct RcuHashMap<K, V> {
    inner: ReadSkewedLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> RcuHashMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: ReadSkewedLock::with_data(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.write(|map| map.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.write(|map| map.remove(key))
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.inner.read().clone()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for RcuHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get() {
        let m: RcuHashMap<u64, &'static str> = RcuHashMap::new();
        m.insert(1, "a");
        assert_eq!(m.get(&1), Some("a"));
        assert_eq!(m.get(&2), None);
        m.remove(&1);
        assert_eq!(m.get(&1), None);
    }
}
