//! Cache configuration

use crate::error::{CacheError, CacheResult};
use crate::reference::{ManagerKind, ReferenceType};

/// Sizing of a segmented concurrent map
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapConfig {
    /// Number of independently locked segments (rounded up to a power of two)
    pub concurrency_level: usize,
    /// Total initial slot count across all segments
    pub initial_capacity: usize,
    /// Entries per slot at which a segment doubles its table
    pub load_factor: f32,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            concurrency_level: 16,
            initial_capacity: 32,
            load_factor: 0.75,
        }
    }
}

impl MapConfig {
    /// Default sizing with a specific segment count
    pub fn with_concurrency_level(concurrency_level: usize) -> Self {
        Self {
            concurrency_level,
            ..Default::default()
        }
    }

    /// Default sizing with a specific initial capacity
    pub fn with_initial_capacity(initial_capacity: usize) -> Self {
        Self {
            initial_capacity,
            ..Default::default()
        }
    }
}

/// Configuration for a `ReflectionCache`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Sizing shared by the cache's maps
    pub map: MapConfig,

    /// How class-keyed entries hold their class (default: weak)
    ///
    /// Soft classes are released by `ReflectionCache::reclaim_soft`; hard
    /// references are rejected since they would never release a class.
    pub class_references: ReferenceType,

    /// How lazily listed members are held (default: soft)
    ///
    /// Weak references are rejected: a member list must stay the same
    /// between calls while it is not reclaimed.
    pub method_references: ReferenceType,

    /// When dropped classes are finalized (default: on reference creation)
    pub manager: ManagerKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            map: MapConfig::default(),
            class_references: ReferenceType::Weak,
            method_references: ReferenceType::Soft,
            manager: ManagerKind::Callback,
        }
    }
}

impl CacheConfig {
    /// Default configuration with a specific reference manager policy
    pub fn with_manager(manager: ManagerKind) -> Self {
        Self {
            manager,
            ..Default::default()
        }
    }

    /// Default configuration with specific map sizing
    pub fn with_map(map: MapConfig) -> Self {
        Self {
            map,
            ..Default::default()
        }
    }

    /// Default configuration with a specific method reference type
    pub fn with_method_references(method_references: ReferenceType) -> Self {
        Self {
            method_references,
            ..Default::default()
        }
    }

    /// Default configuration with a specific class reference type
    pub fn with_class_references(class_references: ReferenceType) -> Self {
        Self {
            class_references,
            ..Default::default()
        }
    }

    /// Check the reference types against what the cache can support
    pub fn validate(&self) -> CacheResult<()> {
        if self.class_references == ReferenceType::Hard {
            return Err(CacheError::InvalidConfig(
                "class references must be weak or soft",
            ));
        }
        if self.method_references == ReferenceType::Weak {
            return Err(CacheError::InvalidConfig(
                "method references must be soft or hard",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig::with_class_references(ReferenceType::Soft).validate().is_ok());
        assert!(CacheConfig::with_method_references(ReferenceType::Hard).validate().is_ok());
    }

    #[test]
    fn test_rejects_unsupported_reference_types() {
        assert!(matches!(
            CacheConfig::with_class_references(ReferenceType::Hard).validate(),
            Err(CacheError::InvalidConfig(_))
        ));
        assert!(matches!(
            CacheConfig::with_method_references(ReferenceType::Weak).validate(),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_map_config_constructors() {
        assert_eq!(MapConfig::with_concurrency_level(4).concurrency_level, 4);
        assert_eq!(MapConfig::with_initial_capacity(64).initial_capacity, 64);
        assert_eq!(MapConfig::default().load_factor, 0.75);
    }
}
