//! Reflection cache facade
//!
//! `ReflectionCache` is the handle the dispatch layer holds. It is built
//! once at runtime start-up from a `CacheConfig`, cloned wherever it is
//! needed, and shut down explicitly (or dropped with its last clone).
//!
//! Every map in the cache is keyed by class identity and holds its classes
//! through the configured reference type, so entries disappear once the
//! embedding runtime drops a class, or immediately on `class_unloaded`.

use crate::cached_class::{CachedClass, CachedMethod};
use crate::class::{Class, DescriptorReflector, Reflector, StandardClasses};
use crate::concurrent::{ConcurrentMap, ManagedConcurrentMap, ManagedDoubleKeyMap};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::reference::{ReferenceBundle, ReferenceManager, ReferentId, Referent};
use crate::stats::{CacheStats, StatsCounters};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Memoized `this$`/`super$` accessor names of one class
#[derive(Default)]
struct MopNames {
    this: ConcurrentMap<Arc<str>, Arc<str>>,
    super_: ConcurrentMap<Arc<str>, Arc<str>>,
}

/// State shared by every clone of a `ReflectionCache`
pub(crate) struct CacheShared {
    config: CacheConfig,
    reflector: Arc<dyn Reflector>,
    classes: StandardClasses,
    manager: Arc<ReferenceManager>,
    class_bundle: Arc<ReferenceBundle>,
    method_bundle: Arc<ReferenceBundle>,
    cached_classes: ManagedConcurrentMap<Class, Arc<CachedClass>>,
    assignable: ManagedDoubleKeyMap<Class, Class, bool>,
    mop_names: ManagedConcurrentMap<Class, Arc<MopNames>>,
    autobox: FxHashMap<ReferentId, Arc<Class>>,
    stats: StatsCounters,
    shut_down: AtomicBool,
}

impl CacheShared {
    pub(crate) fn reflector(&self) -> &dyn Reflector {
        self.reflector.as_ref()
    }

    pub(crate) fn classes(&self) -> &StandardClasses {
        &self.classes
    }

    fn ensure_running(&self) -> CacheResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(CacheError::Shutdown)
        } else {
            Ok(())
        }
    }

    pub(crate) fn get_cached_class(self: &Arc<Self>, class: &Arc<Class>) -> CacheResult<Arc<CachedClass>> {
        self.ensure_running()?;
        if let Some(cached) = self.cached_classes.get(class) {
            StatsCounters::bump(&self.stats.hits);
            return Ok(cached);
        }
        StatsCounters::bump(&self.stats.misses);

        // Computed before taking the segment lock: entry construction must
        // not call back into the cache.
        let is_number = self.reflector.is_assignable_from(&self.classes.number, class);
        let is_void = Arc::ptr_eq(class, &self.classes.void);
        let (cached, inserted) = self.cached_classes.get_or_put_inserted(class, || {
            Arc::new(CachedClass::new(
                class,
                is_number,
                is_void,
                Arc::downgrade(self),
                self.method_bundle.clone(),
            ))
        });

        if inserted {
            StatsCounters::bump(&self.stats.populations);
            tracing::trace!(class = %class.name(), "cached class created");
            if let Err(err) = self.seed_assignability(class, &cached) {
                tracing::warn!(class = %class.name(), error = %err, "failed to seed assignability");
            }
        }
        Ok(cached)
    }

    /// Record that every superclass and interface of `class` accepts it
    fn seed_assignability(&self, class: &Arc<Class>, cached: &Arc<CachedClass>) -> CacheResult<()> {
        let mut current = cached.cached_super_class()?;
        while let Some(ancestor) = current {
            self.assignable.put(&ancestor.class()?, class, true);
            current = ancestor.cached_super_class()?;
        }
        for interface in cached.interfaces()? {
            self.assignable.put(&interface.class()?, class, true);
        }
        Ok(())
    }

    pub(crate) fn is_assignable_from(&self, target: &Arc<Class>, source: &Arc<Class>) -> bool {
        if Arc::ptr_eq(target, source) {
            return true;
        }
        if self.shut_down.load(Ordering::Acquire) {
            return self.reflector.is_assignable_from(target, source);
        }
        if let Some(answer) = self.assignable.get(target, source) {
            StatsCounters::bump(&self.stats.assignability_hits);
            return answer;
        }

        StatsCounters::bump(&self.stats.assignability_checks);
        let answer = self.reflector.is_assignable_from(target, source);
        self.assignable.get_or_put_with(target, source, || answer)
    }
}

/// Handle to the reflection caches of one runtime
///
/// Cloning is cheap; all clones share the same caches.
#[derive(Clone)]
pub struct ReflectionCache {
    shared: Arc<CacheShared>,
}

impl ReflectionCache {
    /// Create a cache answering from the class descriptors themselves
    pub fn new(config: CacheConfig, classes: StandardClasses) -> CacheResult<Self> {
        Self::with_reflector(config, classes, Arc::new(DescriptorReflector::new()))
    }

    /// Create a cache backed by a custom reflector
    pub fn with_reflector(
        config: CacheConfig,
        classes: StandardClasses,
        reflector: Arc<dyn Reflector>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let manager = Arc::new(ReferenceManager::new(config.manager)?);
        let class_bundle = Arc::new(ReferenceBundle::new(config.class_references, manager.clone()));
        let method_bundle = Arc::new(ReferenceBundle::new(config.method_references, manager.clone()));

        let autobox = classes
            .boxing_pairs()
            .into_iter()
            .map(|(primitive, boxed)| (primitive.drop_signal().id(), boxed.clone()))
            .collect();

        tracing::debug!(
            manager = ?config.manager,
            class_references = ?config.class_references,
            segments = config.map.concurrency_level,
            "reflection cache created"
        );

        Ok(Self {
            shared: Arc::new(CacheShared {
                cached_classes: ManagedConcurrentMap::with_config(class_bundle.clone(), &config.map),
                assignable: ManagedDoubleKeyMap::with_config(class_bundle.clone(), &config.map),
                mop_names: ManagedConcurrentMap::with_config(class_bundle.clone(), &config.map),
                config,
                reflector,
                classes,
                manager,
                class_bundle,
                method_bundle,
                autobox,
                stats: StatsCounters::default(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// The configuration the cache was built with
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// The bootstrap classes
    pub fn classes(&self) -> &StandardClasses {
        &self.shared.classes
    }

    /// The reflector answering uncached questions
    pub fn reflector(&self) -> &Arc<dyn Reflector> {
        &self.shared.reflector
    }

    /// The cache entry for `class`, creating it on first use
    ///
    /// Concurrent first lookups of the same class all receive the same entry.
    pub fn get_cached_class(&self, class: &Arc<Class>) -> CacheResult<Arc<CachedClass>> {
        self.shared.get_cached_class(class)
    }

    /// Check if a value of class `source` can be stored as `target` (memoized)
    ///
    /// After `shutdown` the answer is computed without the memo.
    pub fn is_assignable_from(&self, target: &Arc<Class>, source: &Arc<Class>) -> bool {
        self.shared.is_assignable_from(target, source)
    }

    /// Record that `target` accepts values of class `source`
    pub fn set_assignable_from(&self, target: &Arc<Class>, source: &Arc<Class>) {
        if self.shared.ensure_running().is_ok() {
            self.shared.assignable.put(target, source, true);
        }
    }

    /// The boxed counterpart of a primitive class, or the class itself
    pub fn autobox_type(&self, class: &Arc<Class>) -> Arc<Class> {
        if !class.is_primitive() {
            return class.clone();
        }
        self.shared
            .autobox
            .get(&class.drop_signal().id())
            .cloned()
            .unwrap_or_else(|| class.clone())
    }

    /// The method `name` declared by `class` taking exactly `parameter_types`
    ///
    /// `Ok(None)` means no such method; a reflection failure is returned as
    /// an error and not cached.
    pub fn get_declared_method_cached(
        &self,
        class: &Arc<Class>,
        name: &str,
        parameter_types: &[Arc<Class>],
    ) -> CacheResult<Option<CachedMethod>> {
        self.get_cached_class(class)?
            .search_methods(name, parameter_types)
    }

    /// Name of the `this$` (or `super$`) accessor for `name` in `cached`'s class
    ///
    /// The name embeds the class's superclass distance: `this$3$foo`.
    pub fn mop_method_name(&self, cached: &CachedClass, name: &str, use_this: bool) -> CacheResult<Arc<str>> {
        self.shared.ensure_running()?;
        let class = cached.class()?;
        let names = self
            .shared
            .mop_names
            .get_or_put_with(&class, || Arc::new(MopNames::default()));
        let (map, prefix) = if use_this {
            (&names.this, "this")
        } else {
            (&names.super_, "super")
        };
        if let Some(found) = map.get(name) {
            return Ok(found);
        }

        let distance = cached.super_class_distance()?;
        let mop_name: Arc<str> = Arc::from(format!("{prefix}${distance}${name}"));
        Ok(map.get_or_put_with(Arc::from(name), || mop_name))
    }

    /// Check two class lists for element-wise identity
    pub fn array_contents_eq(a: &[Arc<Class>], b: &[Arc<Class>]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
    }

    /// Forget everything cached about `class`
    ///
    /// Returns true if the class had an entry.
    pub fn class_unloaded(&self, class: &Arc<Class>) -> bool {
        let had_entry = self.shared.cached_classes.remove(class).is_some();
        self.shared.mop_names.remove(class);
        let assignability = self.shared.assignable.remove_referencing(class);
        tracing::debug!(
            class = %class.name(),
            had_entry,
            assignability,
            "class unloaded"
        );
        had_entry
    }

    /// Run the finalizers of dropped classes now; returns how many ran
    pub fn process_references(&self) -> usize {
        self.shared.manager.process()
    }

    /// Release every softly held class and member list
    ///
    /// Member lists are listed again on next use. Classes that nothing else
    /// holds are dropped, and their entries go once references are processed.
    pub fn reclaim_soft(&self) -> usize {
        self.shared.method_bundle.reclaim_soft() + self.shared.class_bundle.reclaim_soft()
    }

    /// Purge entries of dropped classes without waiting for finalization
    pub fn expunge_stale(&self) -> usize {
        let shared = &self.shared;
        shared.cached_classes.expunge_stale()
            + shared.assignable.expunge_stale()
            + shared.mop_names.expunge_stale()
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot(
            self.shared.manager.queue().finalized_count(),
            self.shared.cached_classes.len(),
        )
    }

    /// Check if `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Stop the reference manager and drop every entry
    ///
    /// Later lookups fail with `CacheError::Shutdown`.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.manager.shutdown();
        self.shared.cached_classes.clear();
        self.shared.assignable.clear();
        self.shared.mop_names.clear();
        tracing::debug!("reflection cache shut down");
    }
}

impl std::fmt::Debug for ReflectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectionCache")
            .field("cached_classes", &self.shared.cached_classes.len())
            .field("manager", &self.shared.manager.kind())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
