//! Segmented map keyed by reclaimable references

use super::identity_hash;
use super::segment::{Segment, SegmentEntry, Segments};
use crate::config::MapConfig;
use crate::reference::{Finalizable, ManagedReference, ReferenceBundle, Referent};
use std::sync::{Arc, Weak};

struct ManagedEntry<K: Referent, V> {
    key: ManagedReference<K>,
    hash: u32,
    value: V,
    segment: Weak<Segment<ManagedEntry<K, V>>>,
}

impl<K, V> SegmentEntry for ManagedEntry<K, V>
where
    K: Referent,
    V: Send + Sync + 'static,
{
    fn hash(&self) -> u32 {
        self.hash
    }

    fn is_valid(&self) -> bool {
        self.key.is_alive()
    }
}

impl<K, V> Finalizable for ManagedEntry<K, V>
where
    K: Referent,
    V: Send + Sync + 'static,
{
    fn finalize_reference(&self) {
        if let Some(segment) = self.segment.upgrade() {
            segment.remove_entry(self);
        }
        self.key.clear();
    }
}

/// Concurrent map whose keys are held through a `ReferenceBundle`
///
/// Keys are compared by identity (`Arc::ptr_eq`). With a weak bundle an
/// entry becomes invisible as soon as its key is dropped and is removed
/// from its segment when the bundle's manager drains the reference queue.
pub struct ManagedConcurrentMap<K: Referent, V> {
    segments: Segments<ManagedEntry<K, V>>,
    bundle: Arc<ReferenceBundle>,
}

impl<K, V> ManagedConcurrentMap<K, V>
where
    K: Referent,
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

    /// The bundle keys are referenced through
    pub fn bundle(&self) -> &Arc<ReferenceBundle> {
        &self.bundle
    }

    /// Look up the value for `key` without locking
    pub fn get(&self, key: &Arc<K>) -> Option<V> {
        let hash = identity_hash(key);
        self.segments
            .segment_for(hash)
            .get(hash, |e| e.key.refers_to(key))
            .map(|e| e.value.clone())
    }

    /// Return the value for `key`, storing `make()` if absent
    ///
    /// `make` runs under the segment lock; it must not touch this map.
    pub fn get_or_put_with<F>(&self, key: &Arc<K>, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.get_or_put_inserted(key, make).0
    }

    /// Like `get_or_put_with`, also reporting whether this call inserted
    pub(crate) fn get_or_put_inserted<F>(&self, key: &Arc<K>, make: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        let hash = identity_hash(key);
        let bundle = &self.bundle;
        let (entry, inserted) = self.segments.segment_for(hash).get_or_put(
            hash,
            key,
            |e, key| e.key.refers_to(key),
            |key, segment| Self::new_entry(bundle, key, hash, make(), segment),
        );
        if inserted {
            self.bundle.manager().after_reference_creation();
        }
        (entry.value.clone(), inserted)
    }

    /// Store a value for `key`, returning the one it replaced
    pub fn put(&self, key: &Arc<K>, value: V) -> Option<V> {
        let hash = identity_hash(key);
        let bundle = &self.bundle;
        let previous = self.segments.segment_for(hash).put(
            hash,
            key,
            |e, key| e.key.refers_to(key),
            |key, segment| Self::new_entry(bundle, key, hash, value, segment),
        );
        self.bundle.manager().after_reference_creation();
        previous.map(|e| {
            e.key.clear();
            e.value.clone()
        })
    }

    /// Remove the entry for `key`, returning its value
    pub fn remove(&self, key: &Arc<K>) -> Option<V> {
        let hash = identity_hash(key);
        let removed = self
            .segments
            .segment_for(hash)
            .remove(hash, |e| e.key.refers_to(key))?;
        removed.key.clear();
        Some(removed.value.clone())
    }

    /// Entry count, including entries whose key died but was not yet finalized
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

    /// Purge entries whose key is gone; returns how many were removed
    pub fn expunge_stale(&self) -> usize {
        self.segments.iter().map(|s| s.expunge_stale()).sum()
    }

    /// Snapshot of the values whose key is still alive
    pub fn values(&self) -> Vec<V> {
        let mut values = Vec::with_capacity(self.len());
        for segment in self.segments.iter() {
            segment.for_each(|e| values.push(e.value.clone()));
        }
        values
    }

    fn new_entry(
        bundle: &ReferenceBundle,
        key: &Arc<K>,
        hash: u32,
        value: V,
        segment: Weak<Segment<ManagedEntry<K, V>>>,
    ) -> Arc<ManagedEntry<K, V>> {
        Arc::new_cyclic(|me: &Weak<ManagedEntry<K, V>>| {
            let finalizer: Weak<dyn Finalizable> = me.clone();
            ManagedEntry {
                key: ManagedReference::with_finalizer(bundle, key, finalizer),
                hash,
                value,
                segment,
            }
        })
    }
}

impl<K, V> std::fmt::Debug for ManagedConcurrentMap<K, V>
where
    K: Referent,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConcurrentMap")
            .field("len", &self.len())
            .field("capacity", &self.segments.capacity())
            .field("kind", &self.bundle.kind())
            .finish()
    }
}
