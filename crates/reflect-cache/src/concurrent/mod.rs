//! Segmented concurrent maps
//!
//! All three maps share the same engine (`segment`): a fixed array of
//! independently locked segments, each resizing on its own. They differ in
//! how keys are held and compared:
//! - `ConcurrentMap`: owned keys, structural equality
//! - `ManagedConcurrentMap`: keys held through a `ReferenceBundle`, identity equality
//! - `ManagedDoubleKeyMap`: two managed keys, dead when either key is gone

mod double_key;
mod managed;
mod map;
mod segment;

pub use double_key::ManagedDoubleKeyMap;
pub use managed::ManagedConcurrentMap;
pub use map::ConcurrentMap;

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Spread a 64-bit hash into 32 bits with good upper-bit entropy
///
/// Segments are selected by the upper bits and slots by the lower bits,
/// so both ends have to be mixed.
#[inline]
pub(crate) fn spread(h: u64) -> u32 {
    let mut h = (h ^ (h >> 32)) as u32;
    h = h.wrapping_add(!(h << 9));
    h ^= h >> 14;
    h = h.wrapping_add(h << 4);
    h ^= h >> 10;
    h
}

/// Hash of a key under structural equality
#[inline]
pub(crate) fn hash_of<Q: Hash + ?Sized>(key: &Q) -> u32 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    spread(hasher.finish())
}

/// Hash of a shared value under identity equality
#[inline]
pub(crate) fn identity_hash<T: ?Sized>(value: &Arc<T>) -> u32 {
    hash_of(&(Arc::as_ptr(value).cast::<()>() as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_hash_is_stable_per_allocation() {
        let a = Arc::new(1u32);
        assert_eq!(identity_hash(&a), identity_hash(&a.clone()));
        assert_eq!(identity_hash(&a), hash_of(&(Arc::as_ptr(&a) as usize)));
    }

    #[test]
    fn test_spread_mixes_upper_bits() {
        let upper: std::collections::HashSet<u32> = (0u64..64).map(|h| spread(h) >> 28).collect();
        assert!(upper.len() > 1);
    }
}
