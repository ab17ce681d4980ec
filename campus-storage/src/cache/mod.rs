//! Persistent, TTL-based local cache.
//!
//! Entries are stored as `{data, timestamp}` JSON envelopes in a pluggable
//! key-value backend. An entry is valid iff `now - timestamp <= ttl`;
//! expired entries are deleted lazily when read.
//!
//! The store is advisory. Every backend failure (quota exceeded, disk
//! error, storage disabled) is logged and treated as a miss, never
//! propagated.

pub mod file;
pub mod local_store;
pub mod memory;
pub mod traits;

pub use file::FileBackend;
pub use local_store::{CacheEnvelope, LocalCacheStore};
pub use memory::MemoryBackend;
pub use traits::KvBackend;
