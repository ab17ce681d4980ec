use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use campus_core::{Clock, QueryKey, RequestError, RequestResult, SystemClock};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use super::{
    ErrorHandler, QueryCacheConfig, QueryOptions, QueryStats, QueryStatus, UnauthorizedPolicy,
};
use crate::{lock, read, write};

type SharedFetch = Shared<BoxFuture<'static, RequestResult<Value>>>;

/// A running fetch, tagged with the record generation it was started for.
struct InFlight {
    generation: u64,
    fetch: SharedFetch,
}

#[derive(Debug)]
struct QueryRecord {
    data: Option<Value>,
    fetched_at: Option<DateTime<Utc>>,
    invalidated: bool,
    /// Replaced on every invalidation, write and re-creation. A fetch whose
    /// generation no longer matches is neither joined nor stored.
    generation: u64,
    status: QueryStatus,
    last_error: Option<RequestError>,
    observers: usize,
    unobserved_since: Option<DateTime<Utc>>,
}

impl QueryRecord {
    fn new(now: DateTime<Utc>, generation: u64) -> Self {
        Self {
            data: None,
            fetched_at: None,
            invalidated: false,
            generation,
            status: QueryStatus::Idle,
            last_error: None,
            observers: 0,
            unobserved_since: Some(now),
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, stale_time: Duration) -> bool {
        if self.invalidated {
            return false;
        }
        self.fetched_at
            .is_some_and(|at| elapsed(now, at) < stale_time)
    }
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
    background_refreshes: AtomicU64,
    evictions: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

enum Lookup {
    Fresh(Value),
    Stale(Value),
    Miss,
}

struct Inner {
    config: QueryCacheConfig,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<QueryKey, QueryRecord>>,
    // lock order: inflight before records
    inflight: Mutex<HashMap<QueryKey, InFlight>>,
    next_generation: AtomicU64,
    error_handler: RwLock<Option<ErrorHandler>>,
    counters: Counters,
}

impl Inner {
    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn record<'a>(
        &self,
        records: &'a mut HashMap<QueryKey, QueryRecord>,
        key: &QueryKey,
        now: DateTime<Utc>,
    ) -> &'a mut QueryRecord {
        records
            .entry(key.clone())
            .or_insert_with(|| QueryRecord::new(now, self.generation()))
    }

    /// Store a fetch outcome. Outcomes for a superseded generation (the
    /// record was invalidated, written, removed or cleared meanwhile) only
    /// reach the waiters of that fetch.
    fn complete(&self, key: &QueryKey, generation: u64, result: &RequestResult<Value>) {
        let now = self.clock.now();
        {
            let mut inflight = lock(&self.inflight);
            if inflight.get(key).is_some_and(|f| f.generation == generation) {
                inflight.remove(key);
            }
            let newer_fetch = inflight.contains_key(key);

            let mut records = lock(&self.records);
            match records.get_mut(key) {
                Some(record) if record.generation == generation => match result {
                    Ok(data) => {
                        record.data = Some(data.clone());
                        record.fetched_at = Some(now);
                        record.invalidated = false;
                        record.status = QueryStatus::Success;
                        record.last_error = None;
                    }
                    Err(err) => {
                        record.status = QueryStatus::Error;
                        record.last_error = Some(err.clone());
                    }
                },
                Some(record) => {
                    debug!(key = %key, "Dropping superseded fetch result");
                    if !newer_fetch && record.status == QueryStatus::Fetching {
                        record.status = if record.data.is_some() {
                            QueryStatus::Success
                        } else {
                            QueryStatus::Idle
                        };
                    }
                }
                None => {}
            }
        }

        if let Err(err) = result {
            self.report(err, Some(key));
        }
    }

    fn report(&self, err: &RequestError, key: Option<&QueryKey>) {
        let key_display = key.map(ToString::to_string).unwrap_or_default();
        if err.is_reportable() {
            error!(key = %key_display, error = %err, "Query failed");
            let handler = read(&self.error_handler).clone();
            if let Some(handler) = handler {
                handler(err, key);
            }
        } else {
            warn!(key = %key_display, status = ?err.status(), error = %err, "Query rejected");
        }
    }

    fn gc(&self) -> usize {
        let now = self.clock.now();
        let gc_time = self.config.gc_time;
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|key, record| {
            let expired = record.observers == 0
                && record.status != QueryStatus::Fetching
                && record
                    .unobserved_since
                    .is_some_and(|since| elapsed(now, since) > gc_time);
            if expired {
                debug!(key = %key, "Evicting unobserved query");
            }
            !expired
        });
        let evicted = before - records.len();
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }
}

/// In-memory read-through cache with stale-while-revalidate.
///
/// Cloning is cheap; clones share records. Fetches run on spawned tokio
/// tasks, so reads must happen inside a tokio runtime.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(QueryCacheConfig::default())
    }
}

impl QueryCache {
    pub fn new(config: QueryCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueryCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                records: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                error_handler: RwLock::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    /// Register the global handler for network and 5xx failures.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&RequestError, Option<&QueryKey>) + Send + Sync + 'static,
    {
        *write(&self.inner.error_handler) = Some(Arc::new(handler));
    }

    pub fn clear_error_handler(&self) {
        *write(&self.inner.error_handler) = None;
    }

    /// Read `key`, propagating every error.
    pub async fn query<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> RequestResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RequestResult<T>> + Send + 'static,
    {
        let value = self
            .read_value(key, self.inner.config.stale_time, fetcher)
            .await?;
        decode(key, value)
    }

    /// Read `key` with per-call options.
    ///
    /// Resolves to `None` only for a 401/403 under
    /// [`UnauthorizedPolicy::ReturnNone`].
    pub async fn query_with<T, F, Fut>(
        &self,
        key: &QueryKey,
        options: &QueryOptions,
        fetcher: F,
    ) -> RequestResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RequestResult<T>> + Send + 'static,
    {
        let stale_time = options.stale_time.unwrap_or(self.inner.config.stale_time);
        match self.read_value(key, stale_time, fetcher).await {
            Ok(value) => decode(key, value).map(Some),
            Err(err)
                if err.is_unauthorized()
                    && options.on_unauthorized == UnauthorizedPolicy::ReturnNone =>
            {
                debug!(key = %key, "Unauthorized optional read resolved to none");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn read_value<T, F, Fut>(
        &self,
        key: &QueryKey,
        stale_time: Duration,
        fetcher: F,
    ) -> RequestResult<Value>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RequestResult<T>> + Send + 'static,
    {
        let now = self.inner.clock.now();
        let lookup = {
            let mut records = lock(&self.inner.records);
            let record = self.inner.record(&mut records, key, now);
            // unobserved reads restart the GC countdown
            if record.observers == 0 {
                record.unobserved_since = Some(now);
            }
            match &record.data {
                Some(data) if record.is_fresh(now, stale_time) => Lookup::Fresh(data.clone()),
                Some(data) if !record.invalidated => Lookup::Stale(data.clone()),
                _ => Lookup::Miss,
            }
        };

        match lookup {
            Lookup::Fresh(data) => {
                bump(&self.inner.counters.hits);
                debug!(key = %key, "Query served fresh");
                Ok(data)
            }
            Lookup::Stale(data) => {
                bump(&self.inner.counters.hits);
                let (_, started) = self.start_fetch(key, fetcher);
                if started {
                    bump(&self.inner.counters.background_refreshes);
                    debug!(key = %key, "Query served stale, revalidating");
                }
                Ok(data)
            }
            Lookup::Miss => {
                bump(&self.inner.counters.misses);
                let (fetch, _) = self.start_fetch(key, fetcher);
                fetch.await
            }
        }
    }

    /// Join the in-flight fetch for `key` or start one. The flag is true
    /// when a new fetch was started.
    fn start_fetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> (SharedFetch, bool)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RequestResult<T>> + Send + 'static,
    {
        let mut inflight = lock(&self.inner.inflight);
        let generation = {
            let now = self.inner.clock.now();
            let mut records = lock(&self.inner.records);
            let record = self.inner.record(&mut records, key, now);
            // a fetch started before the last invalidation or clear is
            // never joined
            if let Some(existing) = inflight
                .get(key)
                .filter(|f| f.generation == record.generation)
            {
                bump(&self.inner.counters.coalesced);
                debug!(key = %key, "Joining in-flight fetch");
                return (existing.fetch.clone(), false);
            }
            record.status = QueryStatus::Fetching;
            record.generation
        };
        bump(&self.inner.counters.fetches);

        let mut guard = FetchGuard {
            inner: Arc::downgrade(&self.inner),
            key: key.clone(),
            generation,
            finished: false,
        };
        let task = tokio::spawn(async move {
            let result = match fetcher().await {
                Ok(data) => serde_json::to_value(data).map_err(|e| RequestError::Serialize {
                    message: e.to_string(),
                }),
                Err(err) => Err(err),
            };
            guard.finish(&result);
            result
        });

        let shared = async move {
            task.await.unwrap_or_else(|join_err| {
                Err(RequestError::network(format!(
                    "fetch task failed: {join_err}"
                )))
            })
        }
        .boxed()
        .shared();

        inflight.insert(
            key.clone(),
            InFlight {
                generation,
                fetch: shared.clone(),
            },
        );
        (shared, true)
    }

    /// Warm `key` unless it is already fresh.
    pub async fn prefetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> RequestResult<()>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RequestResult<T>> + Send + 'static,
    {
        let now = self.inner.clock.now();
        let fresh = lock(&self.inner.records)
            .get(key)
            .is_some_and(|r| r.data.is_some() && r.is_fresh(now, self.inner.config.stale_time));
        if fresh {
            return Ok(());
        }
        let (fetch, _) = self.start_fetch(key, fetcher);
        fetch.await.map(|_| ())
    }

    /// Mark matching records stale so their next read blocks on a refetch.
    pub fn invalidate<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryKey) -> bool,
    {
        let mut records = lock(&self.inner.records);
        let mut count = 0;
        for (_, record) in records.iter_mut().filter(|(key, _)| predicate(key)) {
            record.invalidated = true;
            record.generation = self.inner.generation();
            count += 1;
        }
        debug!(invalidated = count, "Invalidated queries");
        count
    }

    /// Invalidate every key of one resource, e.g. `"notes"`.
    pub fn invalidate_resource(&self, resource: &str) -> usize {
        self.invalidate(|key| key.is_for(resource))
    }

    /// Run a write and, on success, invalidate the keys it affects.
    pub async fn mutate<T, Fut, P>(&self, mutation: Fut, invalidates: P) -> RequestResult<T>
    where
        Fut: Future<Output = RequestResult<T>>,
        P: Fn(&QueryKey) -> bool,
    {
        match mutation.await {
            Ok(value) => {
                self.invalidate(invalidates);
                Ok(value)
            }
            Err(err) => {
                self.inner.report(&err, None);
                Err(err)
            }
        }
    }

    pub fn set_query_data<T: Serialize + ?Sized>(
        &self,
        key: &QueryKey,
        data: &T,
    ) -> RequestResult<()> {
        let value = serde_json::to_value(data).map_err(|e| RequestError::Serialize {
            message: e.to_string(),
        })?;
        let now = self.inner.clock.now();
        let mut records = lock(&self.inner.records);
        let record = self.inner.record(&mut records, key, now);
        // supersedes any fetch still running for the old generation
        record.generation = self.inner.generation();
        record.data = Some(value);
        record.fetched_at = Some(now);
        record.invalidated = false;
        record.status = QueryStatus::Success;
        record.last_error = None;
        Ok(())
    }

    /// Cached payload regardless of staleness.
    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let data = lock(&self.inner.records).get(key)?.data.clone()?;
        serde_json::from_value(data).ok()
    }

    pub fn status(&self, key: &QueryKey) -> Option<QueryStatus> {
        lock(&self.inner.records).get(key).map(|r| r.status)
    }

    pub fn last_error(&self, key: &QueryKey) -> Option<RequestError> {
        lock(&self.inner.records)
            .get(key)
            .and_then(|r| r.last_error.clone())
    }

    pub fn remove(&self, key: &QueryKey) -> bool {
        lock(&self.inner.records).remove(key).is_some()
    }

    /// Drop every record and forget running fetches. Their results still
    /// reach their own waiters but are never stored or joined.
    pub fn clear(&self) {
        let mut inflight = lock(&self.inner.inflight);
        inflight.clear();
        lock(&self.inner.records).clear();
        debug!("Query cache cleared");
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register interest in `key`. The record is not garbage collected while
    /// the returned guard is alive.
    pub fn observe(&self, key: &QueryKey) -> QueryObserver {
        let now = self.inner.clock.now();
        let mut records = lock(&self.inner.records);
        let record = self.inner.record(&mut records, key, now);
        record.observers += 1;
        record.unobserved_since = None;
        QueryObserver {
            inner: Arc::downgrade(&self.inner),
            key: key.clone(),
        }
    }

    /// Evict records unobserved for longer than the GC time.
    pub fn gc(&self) -> usize {
        self.inner.gc()
    }

    /// Run [`QueryCache::gc`] every `interval` until the cache is dropped.
    pub fn spawn_gc(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = inner.gc();
                if evicted > 0 {
                    debug!(evicted, "Query GC pass");
                }
            }
        })
    }

    pub fn stats(&self) -> QueryStats {
        let c = &self.inner.counters;
        QueryStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            background_refreshes: c.background_refreshes.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }
}

/// Settles the record of a spawned fetch. A fetcher that panics or a task
/// that is cancelled still completes its generation with an error.
struct FetchGuard {
    inner: Weak<Inner>,
    key: QueryKey,
    generation: u64,
    finished: bool,
}

impl FetchGuard {
    fn finish(&mut self, result: &RequestResult<Value>) {
        self.finished = true;
        if let Some(inner) = self.inner.upgrade() {
            inner.complete(&self.key, self.generation, result);
        }
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(key = %self.key, "Fetch task ended without a result");
            self.finish(&Err(RequestError::network("fetch task did not finish")));
        }
    }
}

fn decode<T: DeserializeOwned>(key: &QueryKey, value: Value) -> RequestResult<T> {
    serde_json::from_value(value).map_err(|e| RequestError::Decode {
        message: format!("{key}: {e}"),
    })
}

/// Keeps one query record alive. Dropping it starts the GC countdown once
/// no observers remain.
#[derive(Debug)]
pub struct QueryObserver {
    inner: Weak<Inner>,
    key: QueryKey,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let now = inner.clock.now();
        let mut records = lock(&inner.records);
        if let Some(record) = records.get_mut(&self.key) {
            record.observers = record.observers.saturating_sub(1);
            if record.observers == 0 {
                record.unobserved_since = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_test_utils::ManualClock;
    use futures_util::future::{ready, Ready};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache_with_clock() -> (QueryCache, ManualClock) {
        let clock = ManualClock::new();
        let cache = QueryCache::with_clock(QueryCacheConfig::default(), Arc::new(clock.clone()));
        (cache, clock)
    }

    fn counted(
        calls: &Arc<AtomicUsize>,
        result: RequestResult<Value>,
    ) -> impl FnOnce() -> Ready<RequestResult<Value>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(result)
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_miss_then_fresh_hit() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("notes");

        let first: Value = cache.query(&key, counted(&calls, Ok(json!([1])))).await.unwrap();
        let second: Value = cache.query(&key, counted(&calls, Ok(json!([2])))).await.unwrap();

        assert_eq!(first, json!([1]));
        assert_eq!(second, json!([1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status(&key), Some(QueryStatus::Success));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.fetches), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_stale_while_revalidate() {
        let (cache, clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("vendors");
        cache.set_query_data(&key, &json!(["old"])).unwrap();

        clock.advance(Duration::from_secs(6 * 60));
        let served: Value = cache
            .query(&key, counted(&calls, Ok(json!(["new"]))))
            .await
            .unwrap();
        assert_eq!(served, json!(["old"]));

        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_query_data::<Value>(&key), Some(json!(["new"])));
        assert_eq!(cache.stats().background_refreshes, 1);
    }

    #[tokio::test]
    async fn test_per_call_stale_time() {
        let (cache, clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("notifications");
        cache.set_query_data(&key, &json!(1)).unwrap();
        clock.advance(Duration::from_secs(90));

        let options = QueryOptions::new().with_stale_time(Duration::from_secs(60));
        let _: Option<Value> = cache
            .query_with(&key, &options, counted(&calls, Ok(json!(2))))
            .await
            .unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_share_one_fetch() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("events");

        let slow = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, RequestError>(json!(["e1"]))
            }
        };

        let (a, b, c) = tokio::join!(
            cache.query::<Value, _, _>(&key, slow(calls.clone())),
            cache.query::<Value, _, _>(&key, slow(calls.clone())),
            cache.query::<Value, _, _>(&key, slow(calls.clone())),
        );
        assert_eq!(a.unwrap(), json!(["e1"]));
        assert_eq!(b.unwrap(), json!(["e1"]));
        assert_eq!(c.unwrap(), json!(["e1"]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().coalesced, 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_blocking_refetch() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let notes = QueryKey::new("notes");
        let vendors = QueryKey::new("vendors");
        cache.set_query_data(&notes, &json!("v1")).unwrap();
        cache.set_query_data(&vendors, &json!("v1")).unwrap();

        assert_eq!(cache.invalidate_resource("notes"), 1);

        let value: Value = cache
            .query(&notes, counted(&calls, Ok(json!("v2"))))
            .await
            .unwrap();
        assert_eq!(value, json!("v2"));
        let value: Value = cache
            .query(&vendors, counted(&calls, Ok(json!("v2"))))
            .await
            .unwrap();
        assert_eq!(value, json!("v1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_survives() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("projects");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let reader = {
            let cache = cache.clone();
            let key = key.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .query::<Value, _, _>(&key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = rx.await;
                        Ok(json!("before-write"))
                    })
                    .await
            })
        };
        settle().await;
        cache.invalidate(|k| k.is_for("projects"));
        tx.send(()).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), json!("before-write"));

        let value: Value = cache
            .query(&key, counted(&calls, Ok(json!("after-write"))))
            .await
            .unwrap();
        assert_eq!(value, json!("after-write"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_policy_is_per_call() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("notifications");
        let denied = || Err(RequestError::http(401, "session expired"));

        let optional: Option<Value> = cache
            .query_with(&key, &QueryOptions::new().optional(), counted(&calls, denied()))
            .await
            .unwrap();
        assert!(optional.is_none());

        let protected = cache
            .query_with::<Value, _, _>(&key, &QueryOptions::new(), counted(&calls, denied()))
            .await;
        assert_eq!(protected.unwrap_err().status(), Some(401));
        assert_eq!(cache.status(&key), Some(QueryStatus::Error));
    }

    #[tokio::test]
    async fn test_error_handler_receives_only_reportable_errors() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            cache.set_error_handler(move |err, key| {
                seen.lock()
                    .unwrap()
                    .push((err.status(), key.map(ToString::to_string)));
            });
        }

        let missing = cache
            .query::<Value, _, _>(
                &QueryKey::new("notes/x"),
                counted(&calls, Err(RequestError::http(404, "not found"))),
            )
            .await;
        assert!(missing.is_err());

        let broken = cache
            .query::<Value, _, _>(
                &QueryKey::new("vendors"),
                counted(&calls, Err(RequestError::http(503, "unavailable"))),
            )
            .await;
        assert_eq!(broken.unwrap_err().status(), Some(503));

        let offline = cache
            .mutate::<Value, _, _>(async { Err(RequestError::network("offline")) }, |_| true)
            .await;
        assert!(offline.is_err());

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(Some(503), Some("vendors".to_string())), (None, None)]
        );
    }

    #[tokio::test]
    async fn test_mutate_invalidates_on_success_only() {
        let (cache, _) = cache_with_clock();
        let key = QueryKey::new("notes");
        cache.set_query_data(&key, &json!([])).unwrap();

        let failed = cache
            .mutate::<Value, _, _>(async { Err(RequestError::http(400, "bad")) }, |k| {
                k.is_for("notes")
            })
            .await;
        assert!(failed.is_err());

        let calls = Arc::new(AtomicUsize::new(0));
        let _: Value = cache.query(&key, counted(&calls, Ok(json!([1])))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let created = cache
            .mutate(async { Ok::<_, RequestError>(json!({"id": 1})) }, |k| {
                k.is_for("notes")
            })
            .await
            .unwrap();
        assert_eq!(created["id"], 1);
        let listed: Value = cache.query(&key, counted(&calls, Ok(json!([1])))).await.unwrap();
        assert_eq!(listed, json!([1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gc_respects_observers() {
        let (cache, clock) = cache_with_clock();
        let watched = QueryKey::new("notes");
        let idle = QueryKey::new("vendors");
        cache.set_query_data(&watched, &json!(1)).unwrap();
        cache.set_query_data(&idle, &json!(2)).unwrap();

        let observer = cache.observe(&watched);
        clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(cache.gc(), 1);
        assert!(cache.get_query_data::<Value>(&idle).is_none());
        assert!(cache.get_query_data::<Value>(&watched).is_some());

        drop(observer);
        clock.advance(Duration::from_secs(29 * 60));
        assert_eq!(cache.gc(), 0);
        clock.advance(Duration::from_secs(2 * 60));
        assert_eq!(cache.gc(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_gc_runs_periodically() {
        let (cache, clock) = cache_with_clock();
        cache.set_query_data(&QueryKey::new("events"), &json!([])).unwrap();
        let handle = cache.spawn_gc(Duration::from_secs(60));

        clock.advance(Duration::from_secs(31 * 60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert!(cache.is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn test_prefetch_skips_fresh() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("projects");

        cache.prefetch(&key, counted(&calls, Ok(json!([])))).await.unwrap();
        cache.prefetch(&key, counted(&calls, Ok(json!([])))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_drops_late_results() {
        let (cache, _) = cache_with_clock();
        let key = QueryKey::new("notes");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let reader = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .query::<Value, _, _>(&key, move || async move {
                        let _ = rx.await;
                        Ok(json!("stale session"))
                    })
                    .await
            })
        };
        settle().await;
        cache.clear();
        tx.send(()).unwrap();
        let _ = reader.await.unwrap();
        assert!(cache.get_query_data::<Value>(&key).is_none());
    }

    #[tokio::test]
    async fn test_read_after_invalidate_skips_running_refresh() {
        let (cache, clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("notes");
        cache.set_query_data(&key, &json!("pre-write")).unwrap();
        clock.advance(Duration::from_secs(6 * 60));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let served: Value = cache
            .query(&key, move || async move {
                let _ = rx.await;
                Ok::<_, RequestError>(json!("pre-write"))
            })
            .await
            .unwrap();
        assert_eq!(served, json!("pre-write"));
        assert_eq!(cache.status(&key), Some(QueryStatus::Fetching));

        cache.invalidate_resource("notes");
        let value: Value = cache
            .query(&key, counted(&calls, Ok(json!("post-write"))))
            .await
            .unwrap();
        assert_eq!(value, json!("post-write"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().coalesced, 0);

        tx.send(()).unwrap();
        settle().await;
        assert_eq!(cache.get_query_data::<Value>(&key), Some(json!("post-write")));
        assert_eq!(cache.status(&key), Some(QueryStatus::Success));
    }

    #[tokio::test]
    async fn test_clear_forgets_running_fetches() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("notifications");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let previous_session = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .query::<Value, _, _>(&key, move || async move {
                        let _ = rx.await;
                        Ok::<_, RequestError>(json!("user-a"))
                    })
                    .await
            })
        };
        settle().await;
        cache.clear();

        let value: Value = cache
            .query(&key, counted(&calls, Ok(json!("user-b"))))
            .await
            .unwrap();
        assert_eq!(value, json!("user-b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tx.send(()).unwrap();
        assert_eq!(previous_session.await.unwrap().unwrap(), json!("user-a"));
        settle().await;
        assert_eq!(cache.get_query_data::<Value>(&key), Some(json!("user-b")));
    }

    #[tokio::test]
    async fn test_panicking_fetch_settles_record() {
        let (cache, clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("vendors");
        cache.set_query_data(&key, &json!(["cached"])).unwrap();
        clock.advance(Duration::from_secs(6 * 60));

        let served: Value = cache
            .query(&key, || -> Ready<RequestResult<Value>> {
                panic!("fetcher exploded")
            })
            .await
            .unwrap();
        assert_eq!(served, json!(["cached"]));
        settle().await;
        assert_eq!(cache.status(&key), Some(QueryStatus::Error));
        assert!(cache.last_error(&key).is_some_and(|e| e.is_network()));

        let served: Value = cache
            .query(&key, counted(&calls, Ok(json!(["fresh"]))))
            .await
            .unwrap();
        assert_eq!(served, json!(["cached"]));
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_query_data::<Value>(&key), Some(json!(["fresh"])));

        let missing = cache
            .query::<Value, _, _>(&QueryKey::new("events"), || -> Ready<RequestResult<Value>> {
                panic!("fetcher exploded")
            })
            .await;
        assert!(missing.unwrap_err().is_network());
        assert_ne!(
            cache.status(&QueryKey::new("events")),
            Some(QueryStatus::Fetching)
        );
    }
}
