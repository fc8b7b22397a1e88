//! Query side of the cache: keyed, time-aware server data with
//! stale-while-revalidate semantics.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::NormalizedError;
use crate::cancel::CancelToken;
use crate::connectivity::ConnectivityMonitor;
use crate::upload::UploadDiagnostics;

use super::key::QueryKey;
use super::retry::RetryPolicy;

// ============================================================================
// Constants
// ============================================================================

/// Default freshness window for query data.
const DEFAULT_STALE_AFTER_SECS: u64 = 60;

/// Default time an unobserved entry is kept before eviction.
const DEFAULT_GC_AFTER_SECS: u64 = 5 * 60;

/// How often the background task sweeps unobserved entries.
const GC_INTERVAL_SECS: u64 = 60;

type JsonFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, NormalizedError>> + Send + Sync>;

/// Per-query timing and retry options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub stale_after: Duration,
    pub gc_after: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            gc_after: Duration::from_secs(DEFAULT_GC_AFTER_SECS),
            retry: RetryPolicy::query_default(),
        }
    }
}

impl QueryOptions {
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn gc_after(mut self, gc_after: Duration) -> Self {
        self.gc_after = gc_after;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

/// Untyped state shared with observers through a watch channel.
#[derive(Debug, Clone)]
struct QueryState {
    data: Option<Value>,
    status: QueryStatus,
    error: Option<NormalizedError>,
    is_fetching: bool,
    updated_at: Option<DateTime<Utc>>,
}

impl QueryState {
    fn idle() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            is_fetching: false,
            updated_at: None,
        }
    }
}

struct Entry {
    state: watch::Sender<QueryState>,
    fetcher: Option<JsonFetcher>,
    options: QueryOptions,
    observers: usize,
    unobserved_since: Option<Instant>,
    fetched_at: Option<Instant>,
    in_flight: bool,
    invalidated: bool,
    /// A fetch was requested while offline
    deferred: bool,
    /// Bumped on every direct write so older in-flight fetches can be discarded
    generation: u64,
}

impl Entry {
    fn new(options: QueryOptions) -> Self {
        let (state, _rx) = watch::channel(QueryState::idle());
        Self {
            state,
            fetcher: None,
            options,
            observers: 0,
            unobserved_since: Some(Instant::now()),
            fetched_at: None,
            in_flight: false,
            invalidated: false,
            deferred: false,
            generation: 0,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.invalidated
            || self
                .fetched_at
                .map(|at| now.duration_since(at) > self.options.stale_after)
                .unwrap_or(true)
    }

    fn needs_fetch(&self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }
        let state = self.state.borrow();
        state.data.is_none() || state.status == QueryStatus::Error || self.is_stale(now)
    }

    fn is_evictable(&self, now: Instant) -> bool {
        self.observers == 0
            && !self.in_flight
            && self
                .unobserved_since
                .map(|since| now.duration_since(since) > self.options.gc_after)
                .unwrap_or(false)
    }
}

struct Inner {
    entries: Mutex<HashMap<QueryKey, Entry>>,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    connectivity: ConnectivityMonitor,
    uploads: UploadDiagnostics,
}

/// Process-wide query/mutation cache.
///
/// Constructed once at the application root and injected where needed.
/// Clone is cheap; clones share the same cache. Only this type writes
/// cache entries; callers go through subscriptions, mutations and the
/// `*_query_data` helpers.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<Inner>,
}

impl QueryClient {
    pub fn new(connectivity: ConnectivityMonitor) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                connectivity,
                uploads: UploadDiagnostics::default(),
            }),
        }
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn upload_diagnostics(&self) -> &UploadDiagnostics {
        &self.inner.uploads
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry>> {
        // A panic while holding the lock leaves the map itself intact
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe to `key`, fetching with `fetcher` when there is no data or
    /// the data is stale. Existing data is served while a refetch runs.
    pub fn subscribe<T, F, Fut>(
        &self,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions,
    ) -> QueryObserver<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, NormalizedError>> + Send + 'static,
    {
        let fetcher: JsonFetcher = Arc::new(move || {
            let fut = fetcher();
            async move {
                let data = fut.await?;
                Ok(serde_json::to_value(data)?)
            }
            .boxed()
        });

        let (rx, should_fetch) = {
            let mut entries = self.entries();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(options.clone()));
            entry.fetcher = Some(fetcher);
            entry.options = options;
            entry.observers += 1;
            entry.unobserved_since = None;
            (entry.state.subscribe(), entry.needs_fetch(Instant::now()))
        };

        if should_fetch {
            self.start_fetch(&key);
        } else {
            debug!(key = %key, "Serving fresh data from cache");
        }

        QueryObserver {
            client: self.clone(),
            key,
            rx,
            _marker: PhantomData,
        }
    }

    fn release(&self, key: &QueryKey) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(key) {
            entry.observers = entry.observers.saturating_sub(1);
            if entry.observers == 0 {
                entry.unobserved_since = Some(Instant::now());
            }
        }
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    /// Start a background fetch for `key`.
    ///
    /// Coalesced with an in-flight fetch; deferred while offline.
    fn start_fetch(&self, key: &QueryKey) {
        let (fetcher, retry, generation) = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            let Some(fetcher) = entry.fetcher.clone() else {
                return;
            };
            if entry.in_flight {
                debug!(key = %key, "Fetch already in flight, coalescing");
                return;
            }
            if !self.inner.connectivity.is_connected() {
                debug!(key = %key, "Offline, deferring fetch until reconnect");
                entry.deferred = true;
                return;
            }
            entry.in_flight = true;
            entry.deferred = false;
            entry.state.send_modify(|state| {
                state.is_fetching = true;
                if state.data.is_none() {
                    state.status = QueryStatus::Fetching;
                }
            });
            (fetcher, entry.options.retry.clone(), entry.generation)
        };

        let client = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let label = key.to_string();
            let result = retry
                .run(&label, &CancelToken::new(), || fetcher())
                .await;
            client.finish_fetch(&key, generation, result);
        });
    }

    fn finish_fetch(&self, key: &QueryKey, generation: u64, result: Result<Value, NormalizedError>) {
        let refetch = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.in_flight = false;

            if entry.generation != generation {
                if self.inner.connectivity.is_connected() {
                    debug!(key = %key, "Entry changed during fetch, discarding result and refetching");
                    entry.state.send_modify(|state| state.is_fetching = false);
                    true
                } else {
                    // No refetch is possible until reconnect. Keep the result as
                    // stale data rather than leaving the entry without any.
                    debug!(key = %key, "Entry changed during fetch while offline, deferring refetch");
                    entry.deferred = true;
                    entry.invalidated = true;
                    entry.state.send_modify(|state| {
                        state.is_fetching = false;
                        if state.data.is_none() {
                            if let Ok(data) = result {
                                state.data = Some(data);
                                state.status = QueryStatus::Success;
                                state.error = None;
                                state.updated_at = Some(Utc::now());
                            }
                        }
                        if state.status == QueryStatus::Fetching {
                            state.status = QueryStatus::Idle;
                        }
                    });
                    false
                }
            } else {
                match result {
                    Ok(data) => {
                        entry.invalidated = false;
                        entry.fetched_at = Some(Instant::now());
                        entry.state.send_modify(|state| {
                            state.data = Some(data);
                            state.status = QueryStatus::Success;
                            state.error = None;
                            state.is_fetching = false;
                            state.updated_at = Some(Utc::now());
                        });
                    }
                    Err(error) => {
                        warn!(key = %key, error = %error, "Query fetch failed");
                        entry.state.send_modify(|state| {
                            state.status = QueryStatus::Error;
                            state.error = Some(error);
                            state.is_fetching = false;
                        });
                    }
                }
                false
            }
        };

        if refetch {
            self.start_fetch(key);
        }
    }

    /// Mark every entry under `prefix` stale and refetch the observed ones.
    /// Returns the number of entries invalidated.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let (count, observed) = {
            let mut entries = self.entries();
            let mut count = 0;
            let mut observed = Vec::new();
            for (key, entry) in entries.iter_mut().filter(|(k, _)| k.starts_with(prefix)) {
                entry.invalidated = true;
                if entry.in_flight {
                    // The running fetch may predate the change being invalidated
                    entry.generation += 1;
                }
                count += 1;
                if entry.observers > 0 {
                    observed.push(key.clone());
                }
            }
            (count, observed)
        };

        debug!(prefix = %prefix, count, refetching = observed.len(), "Invalidated queries");
        for key in observed {
            self.start_fetch(&key);
        }
        count
    }

    /// Refetch every observed entry that is stale, errored or was deferred
    pub fn refetch_on_reconnect(&self) -> usize {
        let keys: Vec<QueryKey> = {
            let entries = self.entries();
            let now = Instant::now();
            entries
                .iter()
                .filter(|(_, e)| e.observers > 0 && !e.in_flight)
                .filter(|(_, e)| {
                    e.deferred || e.is_stale(now) || e.state.borrow().status == QueryStatus::Error
                })
                .map(|(k, _)| k.clone())
                .collect()
        };
        if !keys.is_empty() {
            info!(count = keys.len(), "Refetching queries after reconnect");
        }
        let count = keys.len();
        for key in keys {
            self.start_fetch(&key);
        }
        count
    }

    // =========================================================================
    // Direct cache access
    // =========================================================================

    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let entries = self.entries();
        let entry = entries.get(key)?;
        let state = entry.state.borrow();
        decode(key, state.data.as_ref())
    }

    /// Replace the data for `key`, creating the entry if needed.
    /// An in-flight fetch that started earlier will not overwrite this value.
    pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<(), NormalizedError> {
        let value = serde_json::to_value(data)?;
        let mut entries = self.entries();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(QueryOptions::default()));
        Self::write(entry, value);
        Ok(())
    }

    /// Apply `update` to the cached data for `key`, if there is any.
    /// Returns `true` when the cache was changed.
    pub fn update_query_data<T, F>(&self, key: &QueryKey, update: F) -> bool
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        let current = entry.state.borrow().data.clone();
        let Some(mut data) = decode::<T>(key, current.as_ref()) else {
            return false;
        };
        update(&mut data);
        match serde_json::to_value(&data) {
            Ok(value) => {
                Self::write(entry, value);
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode updated cache data");
                false
            }
        }
    }

    fn write(entry: &mut Entry, value: Value) {
        entry.generation += 1;
        entry.state.send_modify(|state| {
            state.data = Some(value);
            state.status = QueryStatus::Success;
            state.error = None;
            state.updated_at = Some(Utc::now());
        });
    }

    /// Drop every entry. Observers keep their last snapshot.
    pub fn clear(&self) {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        info!(count, "Cleared query cache");
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries().contains_key(key)
    }

    /// Evict unobserved entries idle for longer than their `gc_after`
    pub fn collect_garbage(&self) -> usize {
        let mut entries = self.entries();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|key, entry| {
            let evict = entry.is_evictable(now);
            if evict {
                debug!(key = %key, "Evicting unobserved query");
            }
            !evict
        });
        before - entries.len()
    }

    // =========================================================================
    // Mutation lanes
    // =========================================================================

    /// FIFO lock for one logical mutation key
    pub(crate) fn mutation_lane(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self
            .inner
            .lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lanes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub(crate) fn prune_lanes(&self) {
        let mut lanes = self
            .inner
            .lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// Spawn the reconnect listener and the periodic garbage collector.
    ///
    /// The task ends once every `QueryClient` clone has been dropped.
    pub fn start(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut rx = self.inner.connectivity.subscribe();
        let mut was_connected = rx.borrow_and_update().is_connected;
        tokio::spawn(async move {
            let mut gc = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            gc.tick().await;
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = rx.borrow_and_update().is_connected;
                        let Some(inner) = weak.upgrade() else { break };
                        if connected && !was_connected {
                            QueryClient { inner }.refetch_on_reconnect();
                        }
                        was_connected = connected;
                    }
                    _ = gc.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let evicted = QueryClient { inner }.collect_garbage();
                        if evicted > 0 {
                            debug!(evicted, "Query garbage collection");
                        }
                    }
                }
            }
            debug!("Query cache background task stopped");
        })
    }
}

fn decode<T: DeserializeOwned>(key: &QueryKey, value: Option<&Value>) -> Option<T> {
    let value = value?;
    match serde_json::from_value(value.clone()) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(key = %key, error = %e, "Cached data does not match requested type");
            None
        }
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Read-only view of one cached query.
///
/// Dropping the observer does not cancel an in-flight fetch.
pub struct QueryObserver<T> {
    client: QueryClient,
    key: QueryKey,
    rx: watch::Receiver<QueryState>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> QueryObserver<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn snapshot(&self) -> QuerySnapshot<T> {
        let state = self.rx.borrow();
        QuerySnapshot {
            data: decode(&self.key, state.data.as_ref()),
            status: state.status,
            error: state.error.clone(),
            is_fetching: state.is_fetching,
            updated_at: state.updated_at,
        }
    }

    pub fn data(&self) -> Option<T> {
        decode(&self.key, self.rx.borrow().data.as_ref())
    }

    pub fn status(&self) -> QueryStatus {
        self.rx.borrow().status
    }

    pub fn is_fetching(&self) -> bool {
        self.rx.borrow().is_fetching
    }

    pub fn error(&self) -> Option<NormalizedError> {
        self.rx.borrow().error.clone()
    }

    /// Trigger a refetch; coalesced with any fetch already in flight
    pub fn refetch(&self) {
        self.client.start_fetch(&self.key);
    }

    /// Wait for the next state change. Returns `false` if the entry was dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait until no fetch is running and return the resulting snapshot
    pub async fn settled(&mut self) -> QuerySnapshot<T> {
        let _ = self.rx.wait_for(|state| !state.is_fetching).await;
        self.snapshot()
    }
}

impl<T> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        self.client.release(&self.key);
    }
}

/// Point-in-time, typed copy of a query's state.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
    pub data: Option<T>,
    pub status: QueryStatus,
    pub error: Option<NormalizedError>,
    pub is_fetching: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> QuerySnapshot<T> {
    pub fn age_minutes(&self) -> Option<i64> {
        self.updated_at.map(|at| (Utc::now() - at).num_minutes())
    }

    /// Human-readable age of the data, e.g. "5 minutes ago"
    pub fn age_display(&self) -> String {
        match self.age_minutes() {
            Some(minutes) => describe_age(minutes),
            None => "never".to_string(),
        }
    }
}

/// Age units from largest to smallest: (length in minutes, singular, plural)
const AGE_UNITS: [(i64, &str, &str); 3] = [
    (24 * 60, "day", "days"),
    (60, "hour", "hours"),
    (1, "minute", "minutes"),
];

/// Describe an age in the largest whole unit, rounded to the nearest one.
fn describe_age(minutes: i64) -> String {
    // Negative ages come from clock skew
    let Some(&(length, singular, plural)) = AGE_UNITS.iter().find(|(length, ..)| minutes >= *length)
    else {
        return "just now".to_string();
    };
    let count = (minutes + length / 2) / length;
    let unit = if count == 1 { singular } else { plural };
    format!("{} {} ago", count, unit)
}

// ============================================================================
// Tests
// ============================================================================
