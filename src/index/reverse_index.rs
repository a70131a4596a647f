//! Reverse Index
//!
//! Incrementally maintained mapping from a derived key to the set of objects
//! that produce it. Every mutation takes a single write lock, so a reader
//! never sees an object half way between its old and new keys.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

struct IndexInner<K, V> {
    /// key -> objects carrying that key
    buckets: HashMap<K, BTreeSet<V>>,
    /// object -> keys it is currently filed under
    keys_by_object: HashMap<V, Vec<K>>,
}

impl<K, V> IndexInner<K, V>
where
    K: Hash + Eq + Clone,
    V: Hash + Ord + Clone,
{
    fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            keys_by_object: HashMap::new(),
        }
    }

    fn unfile(&mut self, object: &V) {
        let Some(keys) = self.keys_by_object.remove(object) else {
            return;
        };
        for key in keys {
            if let Some(bucket) = self.buckets.get_mut(&key) {
                bucket.remove(object);
                if bucket.is_empty() {
                    self.buckets.remove(&key);
                }
            }
        }
    }

    fn file(&mut self, object: V, mut keys: Vec<K>) {
        dedup_keys(&mut keys);
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.buckets
                .entry(key.clone())
                .or_default()
                .insert(object.clone());
        }
        self.keys_by_object.insert(object, keys);
    }
}

/// Drop repeated keys while keeping first-seen order
fn dedup_keys<K: Eq>(keys: &mut Vec<K>) {
    let mut i = 0;
    while i < keys.len() {
        if keys[..i].contains(&keys[i]) {
            keys.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Thread-safe reverse index from `K` to objects `V`
pub struct ReverseIndex<K, V> {
    name: &'static str,
    inner: RwLock<IndexInner<K, V>>,
}

impl<K, V> std::fmt::Debug for ReverseIndex<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ReverseIndex")
            .field("name", &self.name)
            .field("keys", &inner.buckets.len())
            .field("objects", &inner.keys_by_object.len())
            .finish()
    }
}

impl<K, V> ReverseIndex<K, V>
where
    K: Hash + Eq + Clone,
    V: Hash + Ord + Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(IndexInner::new()),
        }
    }

    /// File `object` under exactly `keys`, dropping whatever keys it had before.
    /// An empty `keys` removes the object from the index.
    pub fn upsert(&self, object: V, keys: Vec<K>) {
        let mut inner = self.inner.write();
        inner.unfile(&object);
        inner.file(object, keys);
    }

    /// Remove `object` from every bucket
    pub fn remove(&self, object: &V) {
        self.inner.write().unfile(object);
    }

    /// Rebuild the index from a complete listing
    pub fn replace_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (V, Vec<K>)>,
    {
        let mut rebuilt = IndexInner::new();
        for (object, keys) in entries {
            rebuilt.unfile(&object);
            rebuilt.file(object, keys);
        }
        *self.inner.write() = rebuilt;
    }

    /// Objects filed under `key`, in ascending order
    pub fn lookup(&self, key: &K) -> Vec<V> {
        self.inner
            .read()
            .buckets
            .get(key)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.inner.read().buckets.len()
    }

    /// Number of indexed objects
    pub fn object_count(&self) -> usize {
        self.inner.read().keys_by_object.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_upsert_and_lookup() {
        let index: ReverseIndex<String, u32> = ReverseIndex::new("test");
        index.upsert(2, vec!["a".into()]);
        index.upsert(1, vec!["a".into(), "b".into()]);

        assert_eq!(index.lookup(&"a".into()), vec![1, 2]);
        assert_eq!(index.lookup(&"b".into()), vec![1]);
        assert!(index.lookup(&"c".into()).is_empty());
        assert_eq!(index.key_count(), 2);
        assert_eq!(index.object_count(), 2);
    }

    #[test]
    fn test_update_moves_between_buckets() {
        let index: ReverseIndex<String, u32> = ReverseIndex::new("test");
        index.upsert(1, vec!["node-a".into()]);
        index.upsert(1, vec!["node-b".into()]);

        assert!(index.lookup(&"node-a".into()).is_empty());
        assert_eq!(index.lookup(&"node-b".into()), vec![1]);
        // Empty buckets are dropped, not left behind
        assert_eq!(index.key_count(), 1);
    }

    #[test]
    fn test_duplicate_keys_filed_once() {
        let index: ReverseIndex<String, u32> = ReverseIndex::new("test");
        index.upsert(1, vec!["a".into(), "a".into(), "b".into()]);

        assert_eq!(index.lookup(&"a".into()), vec![1]);
        assert_eq!(index.lookup(&"b".into()), vec![1]);
        assert_eq!(index.key_count(), 2);

        // A single removal clears every bucket
        index.remove(&1);
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn test_empty_keys_remove_object() {
        let index: ReverseIndex<String, u32> = ReverseIndex::new("test");
        index.upsert(1, vec!["a".into()]);
        index.upsert(1, vec![]);

        assert!(index.lookup(&"a".into()).is_empty());
        assert_eq!(index.object_count(), 0);
    }

    #[test]
    fn test_remove_unknown_object_is_noop() {
        let index: ReverseIndex<String, u32> = ReverseIndex::new("test");
        index.upsert(1, vec!["a".into()]);
        index.remove(&7);
        index.remove(&1);
        index.remove(&1);

        assert!(index.lookup(&"a".into()).is_empty());
    }

    #[test]
    fn test_replace_all_drops_stale_entries() {
        let index: ReverseIndex<String, u32> = ReverseIndex::new("test");
        index.upsert(1, vec!["a".into()]);
        index.upsert(2, vec!["b".into()]);

        index.replace_all(vec![(2, vec!["a".into()]), (3, vec!["a".into()])]);

        assert_eq!(index.lookup(&"a".into()), vec![2, 3]);
        assert!(index.lookup(&"b".into()).is_empty());
        assert_eq!(index.object_count(), 2);
    }

    #[test]
    fn test_concurrent_writers_leave_consistent_state() {
        let index: Arc<ReverseIndex<String, u32>> = Arc::new(ReverseIndex::new("test"));
        let handles: Vec<_> = (0..8u32)
            .map(|worker| {
                let index = index.clone();
                std::thread::spawn(move || {
                    for round in 0..200u32 {
                        let key = format!("node-{}", round % 3);
                        index.upsert(worker, vec![key]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Last write of every worker was round 199 -> node-1
        assert_eq!(index.lookup(&"node-1".into()), (0..8).collect::<Vec<_>>());
        assert!(index.lookup(&"node-0".into()).is_empty());
        assert!(index.lookup(&"node-2".into()).is_empty());
    }
}
