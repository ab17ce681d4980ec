//! Key-value backend trait for the local cache store.

use campus_core::StoreError;
use std::fmt::Debug;
use std::sync::Arc;

/// String-keyed, string-valued persistent storage.
///
/// This mirrors the browser storage API the store was designed around:
/// synchronous, small values, no transactions. Implementations must be
/// safe to share across tasks.
pub trait KvBackend: Send + Sync + Debug {
    /// Read a value, `Ok(None)` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a value. Deleting an absent key succeeds.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Every key currently stored.
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

impl<T: KvBackend + ?Sized> KvBackend for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        (**self).keys()
    }
}
