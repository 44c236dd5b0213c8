//! Per-class metadata
//!
//! A `CachedClass` memoizes the reflective facts the dispatch layer asks
//! for repeatedly: the declared method table, fields and constructors, the
//! superclass entry, the implemented interfaces, the type hierarchy and the
//! superclass distance. Each fact is filled
//! in at most once per entry (member lists may be reclaimed under memory
//! pressure and are then listed again).
//!
//! An entry refers to its class weakly. It never keeps the class alive,
//! so the owning cache can forget the entry once the class is dropped.

use crate::class::{Class, ClassKind, Constructor, Field, Method, Modifiers};
use crate::error::{CacheError, CacheResult};
use crate::lock::LockableObject;
use crate::reference::{LazyReference, ReferenceBundle};
use crate::reflection_cache::CacheShared;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

const UNCOMPUTED_DISTANCE: i32 = -1;

/// Prefixes of synthetic accessor methods generated for `this`/`super` dispatch
const MOP_PREFIXES: [&str; 2] = ["this$", "super$"];

/// How a candidate's return type relates to the current best match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Specificity {
    /// Each is assignable from the other
    Same,
    /// The candidate's return type is assignable into the current one
    MoreSpecific,
    /// The current return type is assignable into the candidate's
    LessSpecific,
    /// Neither is assignable from the other
    Unrelated,
}

impl Specificity {
    /// Compare `candidate` against `current`, where `is_assignable(a, b)`
    /// answers whether a `b` can be stored as an `a`
    pub fn of<T: ?Sized, F>(current: &T, candidate: &T, is_assignable: F) -> Self
    where
        F: Fn(&T, &T) -> bool,
    {
        match (
            is_assignable(current, candidate),
            is_assignable(candidate, current),
        ) {
            (true, true) => Specificity::Same,
            (true, false) => Specificity::MoreSpecific,
            (false, true) => Specificity::LessSpecific,
            (false, false) => Specificity::Unrelated,
        }
    }

    /// Check if the candidate takes the current match's place
    ///
    /// The scan keeps the last candidate whose return type is at least as
    /// specific as the current one.
    pub fn replaces_current(self) -> bool {
        matches!(self, Specificity::Same | Specificity::MoreSpecific)
    }
}

/// A declared method as seen through the cache
#[derive(Clone)]
pub struct CachedMethod {
    method: Method,
}

impl CachedMethod {
    fn new(method: Method) -> Self {
        Self { method }
    }

    /// Method name
    pub fn name(&self) -> &str {
        self.method.name()
    }

    /// The underlying method descriptor
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Method modifiers
    pub fn modifiers(&self) -> Modifiers {
        self.method.modifiers()
    }

    /// Check if the method is static
    pub fn is_static(&self) -> bool {
        self.modifiers().is_static()
    }

    /// Parameter types
    pub fn parameter_types(&self) -> CacheResult<Vec<Arc<Class>>> {
        Ok(self.method.parameter_types()?)
    }

    /// Check the parameter list against `types` by class identity
    pub fn has_parameter_types(&self, types: &[Arc<Class>]) -> bool {
        self.method.has_parameter_types(types)
    }

    /// Return type
    pub fn return_type(&self) -> CacheResult<Arc<Class>> {
        Ok(self.method.return_type()?)
    }

    /// Declaring class, if still loaded
    pub fn declaring_class(&self) -> Option<Arc<Class>> {
        self.method.declaring_class()
    }

    fn is_mop(&self) -> bool {
        MOP_PREFIXES.iter().any(|p| self.name().starts_with(p))
    }
}

impl std::fmt::Debug for CachedMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let declaring = self.declaring_class();
        f.debug_struct("CachedMethod")
            .field("name", &self.name())
            .field("declaring", &declaring.as_ref().map(|c| c.name()))
            .finish()
    }
}

/// A declared field as seen through the cache
#[derive(Clone, Debug)]
pub struct CachedField {
    field: Field,
}

impl CachedField {
    /// Field name
    pub fn name(&self) -> &str {
        self.field.name()
    }

    /// The underlying field descriptor
    pub fn field(&self) -> &Field {
        &self.field
    }

    /// Field modifiers
    pub fn modifiers(&self) -> Modifiers {
        self.field.modifiers()
    }

    /// Check if the field is static
    pub fn is_static(&self) -> bool {
        self.modifiers().is_static()
    }

    /// Declared type
    pub fn field_type(&self) -> CacheResult<Arc<Class>> {
        Ok(self.field.field_type()?)
    }
}

/// A declared constructor as seen through the cache
#[derive(Clone, Debug)]
pub struct CachedConstructor {
    constructor: Constructor,
}

impl CachedConstructor {
    /// The underlying constructor descriptor
    pub fn constructor(&self) -> &Constructor {
        &self.constructor
    }

    /// Constructor modifiers
    pub fn modifiers(&self) -> Modifiers {
        self.constructor.modifiers()
    }

    /// Parameter types
    pub fn parameter_types(&self) -> CacheResult<Vec<Arc<Class>>> {
        Ok(self.constructor.parameter_types()?)
    }

    /// Check the parameter list against `types` by class identity
    pub fn has_parameter_types(&self, types: &[Arc<Class>]) -> bool {
        self.constructor.has_parameter_types(types)
    }
}

struct MethodTable {
    /// Sorted by name
    methods: Arc<[CachedMethod]>,
    /// Name to position range in `methods`
    index: FxHashMap<Arc<str>, Range<usize>>,
    /// MOP methods of this class and its superclasses, sorted by name
    mop: Arc<[CachedMethod]>,
}

impl MethodTable {
    fn new(mut methods: Vec<CachedMethod>, mut mop: Vec<CachedMethod>) -> Self {
        methods.sort_by(|a, b| a.name().cmp(b.name()));
        mop.sort_by(|a, b| a.name().cmp(b.name()));

        let mut index: FxHashMap<Arc<str>, Range<usize>> = FxHashMap::default();
        for (i, m) in methods.iter().enumerate() {
            index
                .entry(m.method.name_arc().clone())
                .and_modify(|r| r.end = i + 1)
                .or_insert(i..i + 1);
        }

        Self {
            methods: methods.into(),
            index,
            mop: mop.into(),
        }
    }

    fn named(&self, name: &str) -> &[CachedMethod] {
        match self.index.get(name) {
            Some(range) => &self.methods[range.clone()],
            None => &[],
        }
    }
}

/// Cached reflective facts about one class
pub struct CachedClass {
    class: Weak<Class>,
    name: Arc<str>,
    cache: Weak<CacheShared>,
    kind: ClassKind,
    modifiers: Modifiers,
    is_number: bool,
    is_void: bool,
    super_class: OnceCell<Option<Arc<CachedClass>>>,
    declared_interfaces: OnceCell<Arc<[Arc<CachedClass>]>>,
    inherited_interfaces: LazyReference<[Arc<CachedClass>]>,
    /// Hierarchy without the entry itself
    ancestry: LazyReference<[Arc<CachedClass>]>,
    methods: LazyReference<MethodTable>,
    fields: LazyReference<[CachedField]>,
    constructors: LazyReference<[CachedConstructor]>,
    distance: AtomicI32,
    lock: LockableObject,
}

impl CachedClass {
    pub(crate) fn new(
        class: &Arc<Class>,
        is_number: bool,
        is_void: bool,
        cache: Weak<CacheShared>,
        bundle: Arc<ReferenceBundle>,
    ) -> Self {
        let super_class = OnceCell::new();
        if class.is_root() {
            let _ = super_class.set(None);
        }
        Self {
            class: Arc::downgrade(class),
            name: class.name_arc().clone(),
            cache,
            kind: class.kind(),
            modifiers: class.modifiers(),
            is_number,
            is_void,
            super_class,
            declared_interfaces: OnceCell::new(),
            inherited_interfaces: LazyReference::new(bundle.clone()),
            ancestry: LazyReference::new(bundle.clone()),
            methods: LazyReference::new(bundle.clone()),
            fields: LazyReference::new(bundle.clone()),
            constructors: LazyReference::new(bundle),
            distance: AtomicI32::new(UNCOMPUTED_DISTANCE),
            lock: LockableObject::new(),
        }
    }

    /// The described class
    pub fn class(&self) -> CacheResult<Arc<Class>> {
        self.class
            .upgrade()
            .ok_or_else(|| CacheError::Unloaded(self.name.clone()))
    }

    /// Check if this entry describes `class`
    pub fn describes(&self, class: &Arc<Class>) -> bool {
        std::ptr::eq(self.class.as_ptr(), Arc::as_ptr(class))
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class modifiers
    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// Check if the class is an array type
    pub fn is_array(&self) -> bool {
        self.kind == ClassKind::Array
    }

    /// Check if the class is a primitive type
    pub fn is_primitive(&self) -> bool {
        self.kind == ClassKind::Primitive
    }

    /// Check if the class is an interface
    pub fn is_interface(&self) -> bool {
        self.kind == ClassKind::Interface
    }

    /// Check if the class is the numeric base class or one of its subclasses
    pub fn is_number(&self) -> bool {
        self.is_number
    }

    /// Check if the class is `void`
    pub fn is_void(&self) -> bool {
        self.is_void
    }

    fn cache(&self) -> CacheResult<Arc<CacheShared>> {
        self.cache.upgrade().ok_or(CacheError::Shutdown)
    }

    /// Declared methods, excluding synthetic and MOP methods, sorted by name
    ///
    /// Returns the same table on every call until it is reclaimed.
    pub fn methods(&self) -> CacheResult<Arc<[CachedMethod]>> {
        Ok(self.method_table()?.methods.clone())
    }

    /// MOP methods of this class and of its superclasses, sorted by name
    pub fn mop_methods(&self) -> CacheResult<Arc<[CachedMethod]>> {
        Ok(self.method_table()?.mop.clone())
    }

    fn method_table(&self) -> CacheResult<Arc<MethodTable>> {
        self.methods.get_or_try_init(|| -> CacheResult<Arc<MethodTable>> {
            let class = self.class()?;
            let cache = self.cache()?;
            let declared = cache.reflector().declared_methods(&class).map_err(|err| {
                tracing::warn!(class = %self.name, error = %err, "failed to list declared methods");
                err
            })?;

            let mut methods = Vec::with_capacity(declared.len());
            let mut mop = Vec::new();
            for method in declared.into_iter().map(CachedMethod::new) {
                if method.name().contains('+') {
                    continue;
                }
                if method.is_mop() {
                    mop.push(method);
                } else {
                    methods.push(method);
                }
            }
            if let Some(super_class) = self.cached_super_class()? {
                mop.extend(super_class.mop_methods()?.iter().cloned());
            }

            tracing::trace!(class = %self.name, methods = methods.len(), mop = mop.len(), "listed methods");
            Ok(Arc::new(MethodTable::new(methods, mop)))
        })
    }

    /// Declared fields, in declaration order
    pub fn fields(&self) -> CacheResult<Arc<[CachedField]>> {
        self.fields.get_or_try_init(|| -> CacheResult<Arc<[CachedField]>> {
            let class = self.class()?;
            let fields = self.cache()?.reflector().declared_fields(&class).map_err(|err| {
                tracing::warn!(class = %self.name, error = %err, "failed to list declared fields");
                err
            })?;
            Ok(fields.into_iter().map(|field| CachedField { field }).collect())
        })
    }

    /// Declared constructors, excluding synthetic ones
    pub fn constructors(&self) -> CacheResult<Arc<[CachedConstructor]>> {
        self.constructors
            .get_or_try_init(|| -> CacheResult<Arc<[CachedConstructor]>> {
                let class = self.class()?;
                let constructors = self
                    .cache()?
                    .reflector()
                    .declared_constructors(&class)
                    .map_err(|err| {
                        tracing::warn!(class = %self.name, error = %err, "failed to list constructors");
                        err
                    })?;
                Ok(constructors
                    .into_iter()
                    .filter(|c| !c.modifiers().is_synthetic())
                    .map(|constructor| CachedConstructor { constructor })
                    .collect())
            })
    }

    /// Find the method named `name` taking exactly `parameter_types`
    ///
    /// When several methods match, the one with the most specific return
    /// type wins, and among equally specific ones the last in table order.
    pub fn search_methods(
        &self,
        name: &str,
        parameter_types: &[Arc<Class>],
    ) -> CacheResult<Option<CachedMethod>> {
        let table = self.method_table()?;
        let cache = self.cache()?;

        let mut best: Option<(&CachedMethod, Arc<Class>)> = None;
        for method in table
            .named(name)
            .iter()
            .filter(|m| m.has_parameter_types(parameter_types))
        {
            let return_type = method.return_type()?;
            let replaces = match &best {
                None => true,
                Some((_, current)) => Specificity::of(current, &return_type, |a, b| {
                    cache.is_assignable_from(a, b)
                })
                .replaces_current(),
            };
            if replaces {
                best = Some((method, return_type));
            }
        }
        Ok(best.map(|(m, _)| m.clone()))
    }

    /// Entry of the superclass (`None` for the root, interfaces and primitives)
    ///
    /// Arrays of primitives or of the root class report the root; other
    /// arrays report the root's array class.
    pub fn cached_super_class(&self) -> CacheResult<Option<Arc<CachedClass>>> {
        if let Some(resolved) = self.super_class.get() {
            return Ok(resolved.clone());
        }
        let cache = self.cache()?;
        let class = self.class()?;
        let resolved = if self.is_array() {
            let classes = cache.classes();
            let component = class.component_type();
            let target = match component {
                Some(c) if !c.is_primitive() && !c.is_root() => &classes.object_array,
                _ => &classes.object,
            };
            Some(cache.get_cached_class(target)?)
        } else {
            match cache.reflector().superclass_of(&class) {
                Some(superclass) => Some(cache.get_cached_class(&superclass)?),
                None => None,
            }
        };
        Ok(self.super_class.get_or_init(|| resolved).clone())
    }

    /// Entries of the interfaces the class declares directly
    pub fn declared_interfaces(&self) -> CacheResult<Arc<[Arc<CachedClass>]>> {
        self.declared_interfaces
            .get_or_try_init(|| -> CacheResult<Arc<[Arc<CachedClass>]>> {
                let cache = self.cache()?;
                let class = self.class()?;
                cache
                    .reflector()
                    .interfaces_of(&class)
                    .iter()
                    .map(|i| cache.get_cached_class(i))
                    .collect::<CacheResult<Vec<_>>>()
                    .map(Arc::from)
            })
            .cloned()
    }

    /// Entries of every interface the class implements, directly or through
    /// its superclasses and superinterfaces (an interface includes itself)
    pub fn interfaces(self: &Arc<Self>) -> CacheResult<Vec<Arc<CachedClass>>> {
        let inherited = self
            .inherited_interfaces
            .get_or_try_init(|| self.collect_interfaces())?;
        let mut all = Vec::with_capacity(inherited.len() + 1);
        if self.is_interface() {
            all.push(self.clone());
        }
        for interface in inherited.iter() {
            push_unique(&mut all, interface);
        }
        Ok(all)
    }

    fn collect_interfaces(&self) -> CacheResult<Arc<[Arc<CachedClass>]>> {
        let mut found = Vec::new();
        for declared in self.declared_interfaces()?.iter() {
            for interface in declared.interfaces()? {
                push_unique(&mut found, &interface);
            }
        }
        if let Some(super_class) = self.cached_super_class()? {
            for interface in super_class.interfaces()? {
                push_unique(&mut found, &interface);
            }
        }
        Ok(found.into())
    }

    /// This entry followed by every type it can be stored as
    ///
    /// Ordered by first appearance: the entry, the hierarchies of its
    /// declared interfaces, then the hierarchy of its superclass. Interfaces
    /// also list the root class.
    pub fn hierarchy(self: &Arc<Self>) -> CacheResult<Vec<Arc<CachedClass>>> {
        let ancestry = self.ancestry.get_or_try_init(|| self.collect_ancestry())?;
        let mut all = Vec::with_capacity(ancestry.len() + 1);
        all.push(self.clone());
        all.extend(ancestry.iter().cloned());
        Ok(all)
    }

    fn collect_ancestry(&self) -> CacheResult<Arc<[Arc<CachedClass>]>> {
        let mut found = Vec::new();
        for declared in self.declared_interfaces()?.iter() {
            for entry in declared.hierarchy()? {
                push_unique(&mut found, &entry);
            }
        }
        if let Some(super_class) = self.cached_super_class()? {
            for entry in super_class.hierarchy()? {
                push_unique(&mut found, &entry);
            }
        }
        if self.is_interface() {
            let cache = self.cache()?;
            let root = cache.get_cached_class(&cache.classes().object)?;
            push_unique(&mut found, &root);
        }
        Ok(found.into())
    }

    /// Number of classes from this one up to and including the root
    ///
    /// The root class has distance 1. Computed once under the entry's lock.
    pub fn super_class_distance(&self) -> CacheResult<i32> {
        let distance = self.distance.load(Ordering::Acquire);
        if distance != UNCOMPUTED_DISTANCE {
            return Ok(distance);
        }

        let _guard = self.lock.guard();
        let distance = self.distance.load(Ordering::Acquire);
        if distance != UNCOMPUTED_DISTANCE {
            return Ok(distance);
        }

        let cache = self.cache()?;
        let mut distance = 0;
        let mut current = Some(self.class()?);
        while let Some(class) = current {
            distance += 1;
            current = cache.reflector().superclass_of(&class);
        }
        self.distance.store(distance, Ordering::Release);
        Ok(distance)
    }

    /// Check if a value of class `argument` can be passed where this class
    /// is expected; `None` stands for a null value and is always accepted
    pub fn is_assignable_from(&self, argument: Option<&Arc<Class>>) -> CacheResult<bool> {
        match argument {
            None => Ok(true),
            Some(argument) => self.is_directly_assignable(argument),
        }
    }

    /// Check if a value of class `value_class` can be stored as this class
    pub fn is_directly_assignable(&self, value_class: &Arc<Class>) -> CacheResult<bool> {
        Ok(self
            .cache()?
            .is_assignable_from(&self.class()?, value_class))
    }
}

fn push_unique(list: &mut Vec<Arc<CachedClass>>, entry: &Arc<CachedClass>) {
    if !list.iter().any(|e| Arc::ptr_eq(e, entry)) {
        list.push(entry.clone());
    }
}

impl std::fmt::Debug for CachedClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedClass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("distance", &self.distance.load(Ordering::Relaxed))
            .finish()
    }
}
