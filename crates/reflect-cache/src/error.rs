//! Cache errors

use crate::class::ReflectError;
use std::sync::Arc;

/// Errors surfaced by the reflection cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Reflective access to a class failed; nothing was cached
    #[error(transparent)]
    Reflection(#[from] ReflectError),

    /// The class behind a cache entry has been dropped
    #[error("Class {0} has been unloaded")]
    Unloaded(Arc<str>),

    /// The configuration cannot honor the cache's guarantees
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(&'static str),

    /// The cache has been shut down
    #[error("Reflection cache has been shut down")]
    Shutdown,

    /// The reference manager thread could not be started
    #[error("Failed to start reference manager thread: {0}")]
    ManagerSpawn(#[source] std::io::Error),
}

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;
