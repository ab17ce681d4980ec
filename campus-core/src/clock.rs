//! Time source seam for TTL and staleness checks.

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Wall-clock source. Caches take one so tests can move time by hand.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
