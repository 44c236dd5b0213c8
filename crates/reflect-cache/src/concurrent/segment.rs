//! Independently locked map shard
//!
//! A segment owns a power-of-two table of buckets. Tables and buckets are
//! immutable once published: writers (holding the segment lock) build a
//! replacement and swap it in, and the previous one is retired through the
//! epoch collector. Readers pin an epoch and never lock.

use crate::config::MapConfig;
use crate::lock::LockableObject;
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

const MIN_SEGMENT_CAPACITY: usize = 2;
const MAX_SEGMENT_CAPACITY: usize = 1 << 30;
const MAX_SEGMENTS: usize = 1 << 16;

/// An entry stored in a `Segment`
pub(crate) trait SegmentEntry: Send + Sync + 'static {
    /// Spread hash the entry was stored under
    fn hash(&self) -> u32;

    /// False once the entry's key is gone; invalid entries are purged by writers
    fn is_valid(&self) -> bool;
}

type Bucket<E> = Vec<Arc<E>>;

struct Table<E> {
    slots: Box<[Atomic<Bucket<E>>]>,
}

impl<E> Table<E> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Atomic::null()).collect(),
        }
    }

    fn from_buckets(buckets: Vec<Bucket<E>>) -> Self {
        Self {
            slots: buckets
                .into_iter()
                .map(|bucket| {
                    if bucket.is_empty() {
                        Atomic::null()
                    } else {
                        Atomic::new(bucket)
                    }
                })
                .collect(),
        }
    }

    #[inline]
    fn slot(&self, hash: u32) -> &Atomic<Bucket<E>> {
        &self.slots[hash as usize & (self.slots.len() - 1)]
    }
}

impl<E> Drop for Table<E> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            // SAFETY: a table is dropped either by its owning segment or after
            // the epoch collector proved no reader still observes it.
            unsafe {
                let bucket = slot.load(Ordering::Relaxed, epoch::unprotected());
                if !bucket.is_null() {
                    drop(bucket.into_owned());
                }
            }
        }
    }
}

/// Independently locked shard of a segmented map
pub(crate) struct Segment<E> {
    lock: LockableObject,
    table: Atomic<Table<E>>,
    count: AtomicUsize,
    threshold: AtomicUsize,
    load_factor: f32,
}

impl<E: SegmentEntry> Segment<E> {
    fn new(capacity: usize, load_factor: f32) -> Self {
        Self {
            lock: LockableObject::new(),
            table: Atomic::new(Table::new(capacity)),
            count: AtomicUsize::new(0),
            threshold: AtomicUsize::new(threshold_for(capacity, load_factor)),
            load_factor,
        }
    }

    #[inline]
    fn live_match<F>(entry: &E, hash: u32, matches: &F) -> bool
    where
        F: Fn(&E) -> bool,
    {
        entry.hash() == hash && entry.is_valid() && matches(entry)
    }

    fn current_table<'g>(&self, guard: &'g Guard) -> &'g Table<E> {
        let table = self.table.load(Ordering::Acquire, guard);
        // SAFETY: the table pointer is never null and retired tables are only
        // freed after every guard that could observe them is unpinned.
        unsafe { table.deref() }
    }

    fn bucket<'g>(table: &'g Table<E>, hash: u32, guard: &'g Guard) -> &'g [Arc<E>] {
        let bucket = table.slot(hash).load(Ordering::Acquire, guard);
        // SAFETY: as for tables, buckets are retired through the collector.
        match unsafe { bucket.as_ref() } {
            Some(bucket) => bucket.as_slice(),
            None => &[],
        }
    }

    /// Find a live entry without locking
    pub(crate) fn get<F>(&self, hash: u32, matches: F) -> Option<Arc<E>>
    where
        F: Fn(&E) -> bool,
    {
        let guard = epoch::pin();
        let table = self.current_table(&guard);
        Self::bucket(table, hash, &guard)
            .iter()
            .find(|e| Self::live_match(e, hash, &matches))
            .cloned()
    }

    /// Return the live entry matching `key`, installing `make`'s entry if none
    ///
    /// The boolean is true when this call installed the entry.
    pub(crate) fn get_or_put<K, F, M>(
        self: &Arc<Self>,
        hash: u32,
        key: K,
        matches: F,
        make: M,
    ) -> (Arc<E>, bool)
    where
        F: Fn(&E, &K) -> bool,
        M: FnOnce(K, Weak<Segment<E>>) -> Arc<E>,
    {
        if let Some(found) = self.get(hash, |e| matches(e, &key)) {
            return (found, false);
        }

        let _locked = self.lock.guard();
        let guard = epoch::pin();
        let table = self.current_table(&guard);
        let bucket = Self::bucket(table, hash, &guard);
        if let Some(found) = bucket
            .iter()
            .find(|e| Self::live_match(e, hash, &|e: &E| matches(e, &key)))
        {
            return (found.clone(), false);
        }

        let entry = make(key, Arc::downgrade(self));
        let mut replacement: Bucket<E> = bucket.iter().filter(|e| e.is_valid()).cloned().collect();
        let purged = bucket.len() - replacement.len();
        replacement.push(entry.clone());
        self.publish_bucket(table, hash, replacement, &guard);
        self.adjust_count(1, purged);
        self.rehash_if_needed(&guard);
        (entry, true)
    }

    /// Install `make`'s entry, replacing any live entry matching `key`
    pub(crate) fn put<K, F, M>(self: &Arc<Self>, hash: u32, key: K, matches: F, make: M) -> Option<Arc<E>>
    where
        F: Fn(&E, &K) -> bool,
        M: FnOnce(K, Weak<Segment<E>>) -> Arc<E>,
    {
        let _locked = self.lock.guard();
        let guard = epoch::pin();
        let table = self.current_table(&guard);
        let bucket = Self::bucket(table, hash, &guard);

        let mut previous = None;
        let mut replacement: Bucket<E> = Vec::with_capacity(bucket.len() + 1);
        for e in bucket {
            if !e.is_valid() {
                continue;
            }
            if previous.is_none() && Self::live_match(e, hash, &|e: &E| matches(e, &key)) {
                previous = Some(e.clone());
                continue;
            }
            replacement.push(e.clone());
        }
        let purged = bucket.len() - replacement.len() - usize::from(previous.is_some());
        replacement.push(make(key, Arc::downgrade(self)));
        self.publish_bucket(table, hash, replacement, &guard);
        self.adjust_count(usize::from(previous.is_none()), purged);
        self.rehash_if_needed(&guard);
        previous
    }

    /// Remove the live entry matching `matches`
    pub(crate) fn remove<F>(&self, hash: u32, matches: F) -> Option<Arc<E>>
    where
        F: Fn(&E) -> bool,
    {
        let _locked = self.lock.guard();
        let guard = epoch::pin();
        let table = self.current_table(&guard);
        let bucket = Self::bucket(table, hash, &guard);
        let position = bucket
            .iter()
            .position(|e| Self::live_match(e, hash, &matches))?;

        let removed = bucket[position].clone();
        let replacement: Bucket<E> = bucket
            .iter()
            .enumerate()
            .filter(|(i, e)| *i != position && e.is_valid())
            .map(|(_, e)| e.clone())
            .collect();
        let purged = bucket.len() - replacement.len();
        self.publish_bucket(table, hash, replacement, &guard);
        self.adjust_count(0, purged);
        Some(removed)
    }

    /// Remove exactly `entry`, live or not
    pub(crate) fn remove_entry(&self, entry: &E) -> bool {
        let _locked = self.lock.guard();
        let guard = epoch::pin();
        let table = self.current_table(&guard);
        let bucket = Self::bucket(table, entry.hash(), &guard);
        if !bucket.iter().any(|e| std::ptr::eq(e.as_ref(), entry)) {
            return false;
        }

        let replacement: Bucket<E> = bucket
            .iter()
            .filter(|e| !std::ptr::eq(e.as_ref(), entry))
            .cloned()
            .collect();
        let purged = bucket.len() - replacement.len();
        self.publish_bucket(table, entry.hash(), replacement, &guard);
        self.adjust_count(0, purged);
        true
    }

    /// Remove every live entry matching `matches` and every invalid entry
    ///
    /// Returns the number of entries removed.
    pub(crate) fn remove_where<F>(&self, matches: F) -> usize
    where
        F: Fn(&E) -> bool,
    {
        let _locked = self.lock.guard();
        let guard = epoch::pin();
        let table = self.current_table(&guard);
        let mut removed = 0;
        for slot in table.slots.iter() {
            let current = slot.load(Ordering::Acquire, &guard);
            // SAFETY: see `bucket`.
            let Some(bucket) = (unsafe { current.as_ref() }) else {
                continue;
            };
            let replacement: Bucket<E> = bucket
                .iter()
                .filter(|e| {
                    let entry: &E = e;
                    entry.is_valid() && !matches(entry)
                })
                .cloned()
                .collect();
            if replacement.len() == bucket.len() {
                continue;
            }
            removed += bucket.len() - replacement.len();
            Self::swap_slot(slot, replacement, &guard);
        }
        self.adjust_count(0, removed);
        removed
    }

    /// Purge every invalid entry
    pub(crate) fn expunge_stale(&self) -> usize {
        self.remove_where(|_| false)
    }

    /// Remove every entry
    pub(crate) fn clear(&self) {
        let _locked = self.lock.guard();
        let guard = epoch::pin();
        let table = self.current_table(&guard);
        for slot in table.slots.iter() {
            let old = slot.swap(Shared::null(), Ordering::AcqRel, &guard);
            if !old.is_null() {
                // SAFETY: unlinked by the swap above.
                unsafe { guard.defer_destroy(old) };
            }
        }
        self.count.store(0, Ordering::Release);
    }

    /// Visit every live entry
    pub(crate) fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<E>),
    {
        let guard = epoch::pin();
        let table = self.current_table(&guard);
        for slot in table.slots.iter() {
            let current = slot.load(Ordering::Acquire, &guard);
            // SAFETY: see `bucket`.
            if let Some(bucket) = unsafe { current.as_ref() } {
                bucket.iter().filter(|e| e.is_valid()).for_each(&mut f);
            }
        }
    }

    /// Entry count, including invalid entries not yet purged
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Current slot count
    pub(crate) fn capacity(&self) -> usize {
        let guard = epoch::pin();
        self.current_table(&guard).slots.len()
    }

    fn publish_bucket(&self, table: &Table<E>, hash: u32, bucket: Bucket<E>, guard: &Guard) {
        Self::swap_slot(table.slot(hash), bucket, guard);
    }

    fn swap_slot(slot: &Atomic<Bucket<E>>, bucket: Bucket<E>, guard: &Guard) {
        let new = if bucket.is_empty() {
            Shared::null()
        } else {
            Owned::new(bucket).into_shared(guard)
        };
        let old = slot.swap(new, Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: unlinked by the swap above; only the lock holder swaps.
            unsafe { guard.defer_destroy(old) };
        }
    }

    fn adjust_count(&self, added: usize, removed: usize) {
        let count = self.count.load(Ordering::Relaxed);
        self.count
            .store((count + added).saturating_sub(removed), Ordering::Release);
    }

    fn rehash_if_needed(&self, guard: &Guard) {
        if self.count.load(Ordering::Relaxed) <= self.threshold.load(Ordering::Relaxed) {
            return;
        }
        let table = self.current_table(guard);
        let old_capacity = table.slots.len();
        if old_capacity >= MAX_SEGMENT_CAPACITY {
            return;
        }

        let new_capacity = old_capacity << 1;
        let mask = new_capacity - 1;
        let mut buckets: Vec<Bucket<E>> = (0..new_capacity).map(|_| Vec::new()).collect();
        let mut live = 0;
        for slot in table.slots.iter() {
            let current = slot.load(Ordering::Acquire, guard);
            // SAFETY: see `bucket`.
            if let Some(bucket) = unsafe { current.as_ref() } {
                for e in bucket.iter().filter(|e| e.is_valid()) {
                    buckets[e.hash() as usize & mask].push(e.clone());
                    live += 1;
                }
            }
        }

        let old = self
            .table
            .swap(Owned::new(Table::from_buckets(buckets)), Ordering::AcqRel, guard);
        // SAFETY: unlinked by the swap above; its Drop frees the old buckets.
        unsafe { guard.defer_destroy(old) };
        self.count.store(live, Ordering::Release);
        self.threshold
            .store(threshold_for(new_capacity, self.load_factor), Ordering::Relaxed);
        tracing::debug!(
            old_capacity,
            new_capacity,
            entries = live,
            "segment table resized"
        );
    }
}

impl<E> Drop for Segment<E> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader or writer can reach the table.
        unsafe {
            let table = self.table.load(Ordering::Relaxed, epoch::unprotected());
            if !table.is_null() {
                drop(table.into_owned());
            }
        }
    }
}

fn threshold_for(capacity: usize, load_factor: f32) -> usize {
    ((capacity as f32 * load_factor) as usize).max(1)
}

/// The fixed set of segments of a map
pub(crate) struct Segments<E> {
    segments: Box<[Arc<Segment<E>>]>,
    shift: u32,
}

impl<E: SegmentEntry> Segments<E> {
    pub(crate) fn new(config: &MapConfig) -> Self {
        let count = config
            .concurrency_level
            .clamp(1, MAX_SEGMENTS)
            .next_power_of_two();
        let per_segment = config
            .initial_capacity
            .div_ceil(count)
            .clamp(MIN_SEGMENT_CAPACITY, MAX_SEGMENT_CAPACITY)
            .next_power_of_two();
        let load_factor = if config.load_factor > 0.0 {
            config.load_factor
        } else {
            MapConfig::default().load_factor
        };

        Self {
            segments: (0..count)
                .map(|_| Arc::new(Segment::new(per_segment, load_factor)))
                .collect(),
            shift: 32 - count.trailing_zeros(),
        }
    }

    /// The segment responsible for `hash` (selected by its upper bits)
    #[inline]
    pub(crate) fn segment_for(&self, hash: u32) -> &Arc<Segment<E>> {
        let index = hash.checked_shr(self.shift).unwrap_or(0) as usize;
        &self.segments[index & (self.segments.len() - 1)]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Segment<E>>> {
        self.segments.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Slot count across all segments
    pub(crate) fn capacity(&self) -> usize {
        self.segments.iter().map(|s| s.capacity()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct TestEntry {
        key: u32,
        hash: u32,
        valid: AtomicBool,
    }

    impl TestEntry {
        fn new(key: u32, hash: u32) -> Arc<Self> {
            Arc::new(Self {
                key,
                hash,
                valid: AtomicBool::new(true),
            })
        }
    }

    impl SegmentEntry for TestEntry {
        fn hash(&self) -> u32 {
            self.hash
        }

        fn is_valid(&self) -> bool {
            self.valid.load(Ordering::Acquire)
        }
    }

    fn segment(capacity: usize) -> Arc<Segment<TestEntry>> {
        Arc::new(Segment::new(capacity, 0.75))
    }

    #[test]
    fn test_get_or_put_installs_once() {
        let seg = segment(4);
        let (first, inserted) = seg.get_or_put(7, 1, |e, k| e.key == *k, |k, _| TestEntry::new(k, 7));
        assert!(inserted);
        let (second, inserted) = seg.get_or_put(7, 1, |e, k| e.key == *k, |k, _| TestEntry::new(k, 7));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(seg.len(), 1);
    }

    #[test]
    fn test_colliding_hashes_chain_in_bucket() {
        let seg = segment(4);
        seg.get_or_put(3, 1, |e, k| e.key == *k, |k, _| TestEntry::new(k, 3));
        seg.get_or_put(3, 2, |e, k| e.key == *k, |k, _| TestEntry::new(k, 3));

        assert_eq!(seg.get(3, |e| e.key == 1).unwrap().key, 1);
        assert_eq!(seg.get(3, |e| e.key == 2).unwrap().key, 2);
        assert!(seg.get(3, |e| e.key == 3).is_none());
        assert_eq!(seg.len(), 2);
    }

    #[test]
    fn test_put_replaces_and_remove_deletes() {
        let seg = segment(4);
        assert!(seg.put(5, 1, |e, k| e.key == *k, |k, _| TestEntry::new(k, 5)).is_none());
        let replacement = TestEntry::new(1, 5);
        let previous = seg.put(5, 1, |e, k| e.key == *k, |_, _| replacement.clone());
        assert!(previous.is_some());
        assert!(Arc::ptr_eq(&seg.get(5, |e| e.key == 1).unwrap(), &replacement));
        assert_eq!(seg.len(), 1);

        assert!(seg.remove(5, |e| e.key == 1).is_some());
        assert!(seg.remove(5, |e| e.key == 1).is_none());
        assert_eq!(seg.len(), 0);
    }

    #[test]
    fn test_invalid_entries_are_invisible_and_purged() {
        let seg = segment(4);
        let (stale, _) = seg.get_or_put(1, 1, |e, k| e.key == *k, |k, _| TestEntry::new(k, 1));
        stale.valid.store(false, Ordering::Release);

        assert!(seg.get(1, |e| e.key == 1).is_none());
        let (fresh, inserted) = seg.get_or_put(1, 1, |e, k| e.key == *k, |k, _| TestEntry::new(k, 1));
        assert!(inserted);
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(seg.len(), 1);
    }

    #[test]
    fn test_expunge_stale_sweeps_whole_segment() {
        let seg = segment(8);
        let entries: Vec<_> = (0..6)
            .map(|k| seg.get_or_put(k, k, |e, k| e.key == *k, |k, _| TestEntry::new(k, k)).0)
            .collect();
        entries[1].valid.store(false, Ordering::Release);
        entries[4].valid.store(false, Ordering::Release);

        assert_eq!(seg.expunge_stale(), 2);
        assert_eq!(seg.len(), 4);
    }

    #[test]
    fn test_remove_entry_by_identity() {
        let seg = segment(4);
        let (entry, _) = seg.get_or_put(9, 1, |e, k| e.key == *k, |k, _| TestEntry::new(k, 9));
        let other = TestEntry::new(1, 9);

        assert!(!seg.remove_entry(&other));
        assert!(seg.remove_entry(&entry));
        assert!(seg.get(9, |e| e.key == 1).is_none());
        assert_eq!(seg.len(), 0);
    }

    #[test]
    fn test_rehash_keeps_entries() {
        let seg = segment(2);
        for k in 0..64 {
            seg.get_or_put(k, k, |e, k| e.key == *k, |k, _| TestEntry::new(k, k));
        }
        assert!(seg.capacity() >= 64);
        assert_eq!(seg.len(), 64);
        for k in 0..64 {
            assert_eq!(seg.get(k, |e| e.key == k).unwrap().key, k);
        }
    }

    #[test]
    fn test_clear() {
        let seg = segment(4);
        for k in 0..10 {
            seg.get_or_put(k, k, |e, k| e.key == *k, |k, _| TestEntry::new(k, k));
        }
        seg.clear();
        assert_eq!(seg.len(), 0);
        let mut seen = 0;
        seg.for_each(|_| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_segments_select_by_upper_bits() {
        let segments: Segments<TestEntry> = Segments::new(&MapConfig::with_concurrency_level(4));
        assert_eq!(segments.segment_count(), 4);
        let low = segments.segment_for(0x0000_0001);
        let high = segments.segment_for(0xC000_0001);
        assert!(!Arc::ptr_eq(low, high));
        assert!(Arc::ptr_eq(low, segments.segment_for(0x3FFF_FFFF)));
    }

    #[test]
    fn test_single_segment_map() {
        let segments: Segments<TestEntry> = Segments::new(&MapConfig::with_concurrency_level(1));
        assert_eq!(segments.segment_count(), 1);
        assert!(Arc::ptr_eq(
            segments.segment_for(0),
            segments.segment_for(u32::MAX)
        ));
    }
}
