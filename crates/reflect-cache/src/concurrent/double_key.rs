//! Segmented map keyed by a pair of reclaimable references

use super::identity_hash;
use super::segment::{Segment, SegmentEntry, Segments};
use crate::config::MapConfig;
use crate::reference::{Finalizable, ManagedReference, ReferenceBundle, Referent};
use std::sync::{Arc, Weak};

struct DoubleKeyEntry<K1: Referent, K2: Referent, V> {
    key1: ManagedReference<K1>,
    key2: ManagedReference<K2>,
    hash: u32,
    value: V,
    segment: Weak<Segment<DoubleKeyEntry<K1, K2, V>>>,
}

impl<K1: Referent, K2: Referent, V> DoubleKeyEntry<K1, K2, V> {
    fn refers_to(&self, key1: &Arc<K1>, key2: &Arc<K2>) -> bool {
        self.key1.refers_to(key1) && self.key2.refers_to(key2)
    }

    fn clear_keys(&self) {
        self.key1.clear();
        self.key2.clear();
    }
}

impl<K1, K2, V> SegmentEntry for DoubleKeyEntry<K1, K2, V>
where
    K1: Referent,
    K2: Referent,
    V: Send + Sync + 'static,
{
    fn hash(&self) -> u32 {
        self.hash
    }

    fn is_valid(&self) -> bool {
        self.key1.is_alive() && self.key2.is_alive()
    }
}

impl<K1, K2, V> Finalizable for DoubleKeyEntry<K1, K2, V>
where
    K1: Referent,
    K2: Referent,
    V: Send + Sync + 'static,
{
    fn finalize_reference(&self) {
        if let Some(segment) = self.segment.upgrade() {
            segment.remove_entry(self);
        }
        self.clear_keys();
    }
}

fn pair_hash<K1, K2>(key1: &Arc<K1>, key2: &Arc<K2>) -> u32 {
    identity_hash(key1)
        .wrapping_mul(31)
        .wrapping_add(identity_hash(key2))
}

/// Concurrent map keyed by two managed references
///
/// Both keys are compared by identity. An entry dies as soon as either of
/// its keys is dropped; finalization clears both references.
pub struct ManagedDoubleKeyMap<K1: Referent, K2: Referent, V> {
    segments: Segments<DoubleKeyEntry<K1, K2, V>>,
    bundle: Arc<ReferenceBundle>,
}

impl<K1, K2, V> ManagedDoubleKeyMap<K1, K2, V>
where
    K1: Referent,
    K2: Referent,
    V: Clone + Send + Sync + 'static,
{
    /// Create a map with default sizing
    pub fn new(bundle: Arc<ReferenceBundle>) -> Self {
        Self::with_config(bundle, &MapConfig::default())
    }

    /// Create a map with custom sizing
    pub fn with_config(bundle: Arc<ReferenceBundle>, config: &MapConfig) -> Self {
        Self {
            segments: Segments::new(config),
            bundle,
        }
    }

    /// Look up the value for the pair without locking
    pub fn get(&self, key1: &Arc<K1>, key2: &Arc<K2>) -> Option<V> {
        let hash = pair_hash(key1, key2);
        self.segments
            .segment_for(hash)
            .get(hash, |e| e.refers_to(key1, key2))
            .map(|e| e.value.clone())
    }

    /// Return the value for the pair, storing `make()` if absent
    pub fn get_or_put_with<F>(&self, key1: &Arc<K1>, key2: &Arc<K2>, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        let hash = pair_hash(key1, key2);
        let bundle = &self.bundle;
        let (entry, inserted) = self.segments.segment_for(hash).get_or_put(
            hash,
            (key1, key2),
            |e, (key1, key2)| e.refers_to(key1, key2),
            |(key1, key2), segment| Self::new_entry(bundle, key1, key2, hash, make(), segment),
        );
        if inserted {
            self.bundle.manager().after_reference_creation();
        }
        entry.value.clone()
    }

    /// Store a value for the pair, returning the one it replaced
    pub fn put(&self, key1: &Arc<K1>, key2: &Arc<K2>, value: V) -> Option<V> {
        let hash = pair_hash(key1, key2);
        let bundle = &self.bundle;
        let previous = self.segments.segment_for(hash).put(
            hash,
            (key1, key2),
            |e, (key1, key2)| e.refers_to(key1, key2),
            |(key1, key2), segment| Self::new_entry(bundle, key1, key2, hash, value, segment),
        );
        self.bundle.manager().after_reference_creation();
        previous.map(|e| {
            e.clear_keys();
            e.value.clone()
        })
    }

    /// Remove the entry for the pair, returning its value
    pub fn remove(&self, key1: &Arc<K1>, key2: &Arc<K2>) -> Option<V> {
        let hash = pair_hash(key1, key2);
        let removed = self
            .segments
            .segment_for(hash)
            .remove(hash, |e| e.refers_to(key1, key2))?;
        removed.clear_keys();
        Some(removed.value.clone())
    }

    /// Entry count, including dead entries not yet finalized
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.segments.iter().for_each(|s| s.clear());
    }

    /// Purge entries with a dead key; returns how many were removed
    pub fn expunge_stale(&self) -> usize {
        self.segments.iter().map(|s| s.expunge_stale()).sum()
    }

    fn new_entry(
        bundle: &ReferenceBundle,
        key1: &Arc<K1>,
        key2: &Arc<K2>,
        hash: u32,
        value: V,
        segment: Weak<Segment<DoubleKeyEntry<K1, K2, V>>>,
    ) -> Arc<DoubleKeyEntry<K1, K2, V>> {
        Arc::new_cyclic(|me: &Weak<DoubleKeyEntry<K1, K2, V>>| {
            let finalizer: Weak<dyn Finalizable> = me.clone();
            DoubleKeyEntry {
                key1: ManagedReference::with_finalizer(bundle, key1, finalizer.clone()),
                key2: ManagedReference::with_finalizer(bundle, key2, finalizer),
                hash,
                value,
                segment,
            }
        })
    }
}

impl<K, V> ManagedDoubleKeyMap<K, K, V>
where
    K: Referent,
    V: Clone + Send + Sync + 'static,
{
    /// Remove every entry that has `key` in either position
    ///
    /// Hashes mix both keys, so this sweeps every segment.
    pub fn remove_referencing(&self, key: &Arc<K>) -> usize {
        let removed: usize = self
            .segments
            .iter()
            .map(|s| s.remove_where(|e| e.key1.refers_to(key) || e.key2.refers_to(key)))
            .sum();
        tracing::trace!(removed, "removed entries referencing key");
        removed
    }
}

impl<K1, K2, V> std::fmt::Debug for ManagedDoubleKeyMap<K1, K2, V>
where
    K1: Referent,
    K2: Referent,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedDoubleKeyMap")
            .field("len", &self.len())
            .field("capacity", &self.segments.capacity())
            .field("kind", &self.bundle.kind())
            .finish()
    }
}
