//! Reflection Cache
//!
//! This crate provides the metadata caches that sit underneath dynamic
//! method dispatch:
//! - Compact reentrant lock (`lock` module)
//! - Reclaimable references and reference queues (`reference` module)
//! - Segmented concurrent maps with weak/soft keys (`concurrent` module)
//! - Runtime class descriptors and the reflection capability (`class` module)
//! - Per-class metadata records (`cached_class` module)
//! - The cache facade consumed by the dispatch layer (`reflection_cache` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use reflect_cache::{CacheConfig, ReflectionCache, StandardClasses};
//!
//! let classes = StandardClasses::new();
//! let cache = ReflectionCache::new(CacheConfig::default(), classes.clone())?;
//!
//! let array_list = cache.get_cached_class(&classes.array_list)?;
//! assert_eq!(array_list.super_class_distance()?, 4);
//! assert!(cache.is_assignable_from(&classes.collection, &classes.array_list));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cached_class;
pub mod class;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod lock;
pub mod reference;
pub mod reflection_cache;
pub mod stats;

pub use cached_class::{CachedClass, CachedConstructor, CachedField, CachedMethod, Specificity};
pub use class::{
    Class, ClassBuilder, ClassKind, Constructor, ConstructorDef, DescriptorReflector, Field,
    FieldDef, Method, MethodDef, Modifiers, ReflectError, Reflector, StandardClasses, TypeRef,
};
pub use concurrent::{ConcurrentMap, ManagedConcurrentMap, ManagedDoubleKeyMap};
pub use config::{CacheConfig, MapConfig};
pub use error::{CacheError, CacheResult};
pub use lock::{LockError, LockGuard, LockableObject, OwnerId};
pub use reference::{
    DropSignal, Finalizable, LazyReference, ManagedReference, ManagerKind, ReferenceBundle,
    ReferenceManager, ReferenceQueue, ReferenceType, Referent, ReferentId,
};
pub use reflection_cache::ReflectionCache;
pub use stats::CacheStats;
