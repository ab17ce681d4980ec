//! Query/mutation cache.
//!
//! Records are keyed by [`QueryKey`](campus_core::QueryKey) and hold the last
//! successful JSON payload. Reads are served fresh, stale-while-revalidate,
//! or through a blocking fetch; concurrent fetches of one key share a single
//! round-trip.

mod cache;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use campus_core::{QueryKey, RequestError};
use serde::{Deserialize, Serialize};

pub use cache::{QueryCache, QueryObserver};

/// Callback for errors that exhaust local recovery and are network or
/// server failures. The key is `None` for mutations.
pub type ErrorHandler = Arc<dyn Fn(&RequestError, Option<&QueryKey>) + Send + Sync>;

/// Configuration for the query cache.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCacheConfig {
    /// Age after which a record is served stale and refreshed in the background.
    pub stale_time: Duration,
    /// How long a record with no observers survives before GC evicts it.
    pub gc_time: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(5 * 60),
            gc_time: Duration::from_secs(30 * 60),
        }
    }
}

impl QueryCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }
}

/// What a read does with a 401/403.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnauthorizedPolicy {
    /// Return the error so the caller can redirect to login.
    #[default]
    Propagate,
    /// Resolve to `None`. For optional reads.
    ReturnNone,
}

/// Per-call read options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Overrides [`QueryCacheConfig::stale_time`] for this read.
    pub stale_time: Option<Duration>,
    pub on_unauthorized: UnauthorizedPolicy,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn optional(mut self) -> Self {
        self.on_unauthorized = UnauthorizedPolicy::ReturnNone;
        self
    }
}

/// Lifecycle state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Known key, never fetched.
    Idle,
    Fetching,
    Success,
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Success => "success",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    /// Reads answered from a record (fresh or stale).
    pub hits: u64,
    /// Reads that had to wait for a fetch.
    pub misses: u64,
    /// Fetches actually started.
    pub fetches: u64,
    /// Reads that joined an in-flight fetch instead of starting one.
    pub coalesced: u64,
    pub background_refreshes: u64,
    pub evictions: u64,
    pub entry_count: u64,
}

impl QueryStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
