//! Campus Storage - client-side caches
//!
//! Two caches sit between UI reads and the network:
//!
//! - [`cache::LocalCacheStore`]: persistent, TTL-based, best-effort. Used by
//!   the domain services as an offline fallback. Storage failures are logged
//!   and swallowed.
//! - [`query::QueryCache`]: in-memory stale-while-revalidate cache with
//!   in-flight request coalescing, explicit invalidation and observer-based
//!   garbage collection.
//!
//! Both are plain values; construct one per client (or per test) and share
//! it by cloning the handle.

pub mod cache;
pub mod query;

pub use cache::{FileBackend, KvBackend, LocalCacheStore, MemoryBackend};
pub use query::{
    ErrorHandler, QueryCache, QueryCacheConfig, QueryObserver, QueryOptions, QueryStats,
    QueryStatus, UnauthorizedPolicy,
};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panic while holding one of these locks leaves plain map data behind,
// which stays usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
