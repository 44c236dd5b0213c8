//! Reflection capability
//!
//! The caches never inspect a `Class` directly for the facts they memoize;
//! they ask a `Reflector`, which an embedding runtime may replace.

use super::{Class, Constructor, Field, Method, ReflectError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of reflective facts about classes
pub trait Reflector: Send + Sync {
    /// Methods declared directly by `class`
    fn declared_methods(&self, class: &Class) -> Result<Vec<Method>, ReflectError>;

    /// Fields declared directly by `class`
    fn declared_fields(&self, class: &Class) -> Result<Vec<Field>, ReflectError>;

    /// Constructors declared by `class`
    fn declared_constructors(&self, class: &Class) -> Result<Vec<Constructor>, ReflectError>;

    /// Direct superclass of `class`
    fn superclass_of(&self, class: &Class) -> Option<Arc<Class>>;

    /// Interfaces directly implemented by `class`
    fn interfaces_of(&self, class: &Class) -> Vec<Arc<Class>>;

    /// Check if a value of class `source` can be stored as `target`
    fn is_assignable_from(&self, target: &Class, source: &Class) -> bool;
}

/// `Reflector` that answers from the class descriptors themselves
///
/// Counts the expensive calls, which makes cache hits observable.
#[derive(Debug, Default)]
pub struct DescriptorReflector {
    method_listings: AtomicU64,
    member_listings: AtomicU64,
    assignability_checks: AtomicU64,
}

impl DescriptorReflector {
    /// Create a reflector with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `declared_methods` calls so far
    pub fn method_listings(&self) -> u64 {
        self.method_listings.load(Ordering::Relaxed)
    }

    /// Number of `declared_fields` and `declared_constructors` calls so far
    pub fn member_listings(&self) -> u64 {
        self.member_listings.load(Ordering::Relaxed)
    }

    /// Number of `is_assignable_from` calls so far
    pub fn assignability_checks(&self) -> u64 {
        self.assignability_checks.load(Ordering::Relaxed)
    }
}

impl Reflector for DescriptorReflector {
    fn declared_methods(&self, class: &Class) -> Result<Vec<Method>, ReflectError> {
        self.method_listings.fetch_add(1, Ordering::Relaxed);
        if !class.is_accessible() {
            return Err(ReflectError::Inaccessible(class.name_arc().clone()));
        }
        Ok(class.declared_methods().to_vec())
    }

    fn declared_fields(&self, class: &Class) -> Result<Vec<Field>, ReflectError> {
        self.member_listings.fetch_add(1, Ordering::Relaxed);
        if !class.is_accessible() {
            return Err(ReflectError::Inaccessible(class.name_arc().clone()));
        }
        Ok(class.declared_fields().to_vec())
    }

    fn declared_constructors(&self, class: &Class) -> Result<Vec<Constructor>, ReflectError> {
        self.member_listings.fetch_add(1, Ordering::Relaxed);
        if !class.is_accessible() {
            return Err(ReflectError::Inaccessible(class.name_arc().clone()));
        }
        Ok(class.declared_constructors().to_vec())
    }

    fn superclass_of(&self, class: &Class) -> Option<Arc<Class>> {
        class.superclass().cloned()
    }

    fn interfaces_of(&self, class: &Class) -> Vec<Arc<Class>> {
        class.interfaces().to_vec()
    }

    fn is_assignable_from(&self, target: &Class, source: &Class) -> bool {
        self.assignability_checks.fetch_add(1, Ordering::Relaxed);
        target.is_assignable_from(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassBuilder, MethodDef, TypeRef};

    #[test]
    fn test_counts_calls() {
        let reflector = DescriptorReflector::new();
        let object = ClassBuilder::class("Object")
            .method(MethodDef::new("hashCode", vec![], TypeRef::This))
            .build();

        assert_eq!(reflector.declared_methods(&object).unwrap().len(), 1);
        assert!(reflector.is_assignable_from(&object, &object));
        assert!(reflector.superclass_of(&object).is_none());
        assert_eq!(reflector.method_listings(), 1);
        assert_eq!(reflector.assignability_checks(), 1);
    }

    #[test]
    fn test_inaccessible_class_fails_listing() {
        let reflector = DescriptorReflector::new();
        let hidden = ClassBuilder::class("Hidden").inaccessible().build();
        assert_eq!(
            reflector.declared_methods(&hidden).unwrap_err(),
            ReflectError::Inaccessible(Arc::from("Hidden"))
        );
        assert!(reflector.declared_fields(&hidden).is_err());
        assert!(reflector.declared_constructors(&hidden).is_err());
        assert_eq!(reflector.member_listings(), 2);
    }
}
