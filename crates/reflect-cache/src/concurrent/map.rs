//! Segmented map with owned keys

use super::hash_of;
use super::segment::{SegmentEntry, Segments};
use crate::config::MapConfig;
use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

struct StrongEntry<K, V> {
    key: K,
    hash: u32,
    value: V,
}

impl<K: Send + Sync + 'static, V: Send + Sync + 'static> SegmentEntry for StrongEntry<K, V> {
    fn hash(&self) -> u32 {
        self.hash
    }

    fn is_valid(&self) -> bool {
        true
    }
}

/// Concurrent map with lock-free reads and per-segment writes
///
/// Values are cloned out of the map, so `V` is usually an `Arc` or a small
/// `Copy` type.
pub struct ConcurrentMap<K, V> {
    segments: Segments<StrongEntry<K, V>>,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a map with default sizing
    pub fn new() -> Self {
        Self::with_config(&MapConfig::default())
    }

    /// Create a map with custom sizing
    pub fn with_config(config: &MapConfig) -> Self {
        Self {
            segments: Segments::new(config),
        }
    }

    /// Look up a value without locking
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = hash_of(key);
        self.segments
            .segment_for(hash)
            .get(hash, |e| Borrow::<Q>::borrow(&e.key) == key)
            .map(|e| e.value.clone())
    }

    /// Check if a key is present
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Return the value for `key`, storing `make()` if absent
    ///
    /// `make` runs at most once, under the segment lock, and only if no
    /// other thread stored a value first.
    pub fn get_or_put_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        let hash = hash_of(&key);
        let (entry, _) = self.segments.segment_for(hash).get_or_put(
            hash,
            key,
            |e, key| e.key == *key,
            |key, _| {
                Arc::new(StrongEntry {
                    key,
                    hash,
                    value: make(),
                })
            },
        );
        entry.value.clone()
    }

    /// Store a value, returning the one it replaced
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let hash = hash_of(&key);
        self.segments
            .segment_for(hash)
            .put(
                hash,
                key,
                |e, key| e.key == *key,
                |key, _| Arc::new(StrongEntry { key, hash, value }),
            )
            .map(|e| e.value.clone())
    }

    /// Remove a key, returning its value
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = hash_of(key);
        self.segments
            .segment_for(hash)
            .remove(hash, |e| Borrow::<Q>::borrow(&e.key) == key)
            .map(|e| e.value.clone())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count across all segments; grows as segments resize
    pub fn capacity(&self) -> usize {
        self.segments.capacity()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.segments.iter().for_each(|s| s.clear());
    }

    /// Snapshot of all values
    pub fn values(&self) -> Vec<V> {
        let mut values = Vec::with_capacity(self.len());
        for segment in self.segments.iter() {
            segment.for_each(|e| values.push(e.value.clone()));
        }
        values
    }
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for ConcurrentMap<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("segments", &self.segments.segment_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_basic_operations() {
        let map: ConcurrentMap<String, u32> = ConcurrentMap::new();
        assert!(map.is_empty());

        assert_eq!(map.put("a".to_string(), 1), None);
        assert_eq!(map.put("a".to_string(), 2), Some(1));
        assert_eq!(map.get("a"), Some(2));
        assert!(map.contains_key("a"));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove("a"), Some(2));
        assert_eq!(map.get("a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_get_or_put_runs_make_once() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new();
        let calls = AtomicUsize::new(0);
        let make = || {
            calls.fetch_add(1, Ordering::SeqCst);
            42
        };
        assert_eq!(map.get_or_put_with(1, make), 42);
        assert_eq!(map.get_or_put_with(1, make), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let map: ConcurrentMap<u32, u32> =
            ConcurrentMap::with_config(&MapConfig::with_initial_capacity(4));
        let initial = map.capacity();
        for i in 0..10_000 {
            map.put(i, i * 2);
        }
        assert_eq!(map.len(), 10_000);
        assert!((0..10_000).all(|i| map.get(&i) == Some(i * 2)));
        assert_eq!(map.values().len(), 10_000);
        assert!(map.capacity() > initial);
        assert!(format!("{map:?}").contains("capacity"));

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_concurrent_get_or_put_returns_same_value() {
        let map: Arc<ConcurrentMap<u32, Arc<String>>> = Arc::new(ConcurrentMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    (0..500)
                        .map(|k| map.get_or_put_with(k, || Arc::new(format!("{k}-{t}"))))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<Arc<String>>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for k in 0..500 {
            let first = &results[0][k];
            assert!(results.iter().all(|r| Arc::ptr_eq(&r[k], first)));
        }
        assert_eq!(map.len(), 500);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, u16),
        Remove(u8),
        GetOrPut(u8, u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), any::<u16>()).prop_map(|(k, v)| Op::Put(k, v)),
            any::<u8>().prop_map(Op::Remove),
            (any::<u8>(), any::<u16>()).prop_map(|(k, v)| Op::GetOrPut(k, v)),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_hashmap_model(ops in prop::collection::vec(op(), 0..400)) {
            let map: ConcurrentMap<u8, u16> =
                ConcurrentMap::with_config(&MapConfig { concurrency_level: 2, initial_capacity: 2, load_factor: 0.75 });
            let mut model: HashMap<u8, u16> = HashMap::new();

            for op in ops {
                match op {
                    Op::Put(k, v) => prop_assert_eq!(map.put(k, v), model.insert(k, v)),
                    Op::Remove(k) => prop_assert_eq!(map.remove(&k), model.remove(&k)),
                    Op::GetOrPut(k, v) => {
                        prop_assert_eq!(map.get_or_put_with(k, || v), *model.entry(k).or_insert(v))
                    }
                }
            }

            prop_assert_eq!(map.len(), model.len());
            for (k, v) in &model {
                prop_assert_eq!(map.get(k), Some(*v));
            }
        }
    }
}
