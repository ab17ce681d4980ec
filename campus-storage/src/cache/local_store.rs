//! TTL cache over a key-value backend.

use std::sync::Arc;
use std::time::Duration;

use campus_core::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::memory::MemoryBackend;
use super::traits::KvBackend;

/// Stored form of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub data: Value,
    /// Milliseconds since the Unix epoch when the entry was written.
    pub timestamp: i64,
    /// TTL the writer intended, used by [`LocalCacheStore::purge_expired`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl CacheEnvelope {
    fn stored_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp)
    }

    /// Valid iff `now - stored_at <= ttl`.
    fn is_valid(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let Some(stored_at) = self.stored_at() else {
            return false;
        };
        let age = now.signed_duration_since(stored_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age <= ttl,
            // a TTL too large for chrono never expires
            Err(_) => true,
        }
    }
}

/// Best-effort persistent cache with per-read TTLs.
///
/// Cloning is cheap; clones share the backend.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    backend: Arc<dyn KvBackend>,
    clock: Arc<dyn Clock>,
}

impl Default for LocalCacheStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LocalCacheStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: Arc<dyn KvBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// A store over a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// The time source used for entry expiry.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Store `value` under `key`. Never fails; backend errors are logged.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to encode cache entry");
                return;
            }
        };
        let envelope = CacheEnvelope {
            data,
            timestamp: self.clock.now().timestamp_millis(),
            ttl_ms: Some(ttl.as_millis() as u64),
        };
        let encoded = match serde_json::to_string(&envelope) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to encode cache envelope");
                return;
            }
        };
        if let Err(err) = self.backend.set(key, &encoded) {
            warn!(key = %key, error = %err, "Local cache write failed");
        }
    }

    /// Read `key` if present and no older than `ttl`.
    ///
    /// Expired or undecodable entries are deleted and reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        let raw = match self.backend.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %key, error = %err, "Local cache read failed");
                return None;
            }
        };
        let envelope: CacheEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(key = %key, error = %err, "Dropping corrupt cache entry");
                self.remove(key);
                return None;
            }
        };
        if !envelope.is_valid(self.clock.now(), ttl) {
            debug!(key = %key, "Cache entry expired");
            self.remove(key);
            return None;
        }
        match serde_json::from_value(envelope.data) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "Cache entry has unexpected shape");
                self.remove(key);
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Err(err) = self.backend.remove(key) {
            warn!(key = %key, error = %err, "Local cache delete failed");
        }
    }

    /// Delete every key starting with `prefix`. Returns how many were removed.
    pub fn clear(&self, prefix: &str) -> usize {
        let keys = match self.backend.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(prefix = %prefix, error = %err, "Local cache listing failed");
                return 0;
            }
        };
        let mut removed = 0;
        for key in keys.iter().filter(|k| k.starts_with(prefix)) {
            match self.backend.remove(key) {
                Ok(()) => removed += 1,
                Err(err) => warn!(key = %key, error = %err, "Local cache delete failed"),
            }
        }
        debug!(prefix = %prefix, removed, "Cleared local cache namespace");
        removed
    }

    /// Opportunistic sweep using the TTL each entry was written with.
    /// Entries without a recorded TTL are left alone.
    pub fn purge_expired(&self) -> usize {
        let keys = match self.backend.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Local cache listing failed");
                return 0;
            }
        };
        let now = self.clock.now();
        let mut removed = 0;
        for key in keys {
            let Ok(Some(raw)) = self.backend.get(&key) else {
                continue;
            };
            let expired = match serde_json::from_str::<CacheEnvelope>(&raw) {
                Ok(envelope) => match envelope.ttl_ms {
                    Some(ttl_ms) => !envelope.is_valid(now, Duration::from_millis(ttl_ms)),
                    None => false,
                },
                Err(_) => true,
            };
            if expired && self.backend.remove(&key).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}
