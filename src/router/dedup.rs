//! In-flight request tracking.
//!
//! Concurrent requests that map to the same key share one pending result.
//! Entries are removed as soon as their result settles; entries whose
//! completion never arrives (originating context destroyed, handler wedged)
//! are treated as absent once older than the request timeout and are
//! reclaimed by [`RequestDeduplicator::cleanup_stale_requests`].
//!
//! The watcher that removes a settled entry stops waiting at the same
//! deadline, so once cleanup has run nothing in the deduplicator keeps
//! abandoned work alive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

/// Default lifetime of an in-flight entry.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Cloneable handle on a pending result; every clone resolves to the same value.
pub type PendingHandle<T> = Shared<BoxFuture<'static, T>>;

/// Wrap a future so several callers can await its single result.
pub fn pending<T, F>(future: F) -> PendingHandle<T>
where
    T: Clone + Send + Sync + 'static,
    F: std::future::Future<Output = T> + Send + 'static,
{
    future.boxed().shared()
}

/// One tracked request.
pub struct InFlightRequest<T: Clone> {
    pub key: String,
    pub start_time: Instant,
    handle: PendingHandle<T>,
    generation: u64,
}

impl<T: Clone> std::fmt::Debug for InFlightRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRequest")
            .field("key", &self.key)
            .field("start_time", &self.start_time)
            .field("generation", &self.generation)
            .finish()
    }
}

struct DeduplicationState<T: Clone> {
    in_flight: HashMap<String, InFlightRequest<T>>,
    request_timeout: Duration,
    next_generation: u64,
}

impl<T: Clone> DeduplicationState<T> {
    fn live_entry(&self, key: &str, now: Instant) -> Option<&InFlightRequest<T>> {
        self.in_flight
            .get(key)
            .filter(|entry| now.saturating_duration_since(entry.start_time) < self.request_timeout)
    }
}

/// Whether [`RequestDeduplicator::join_or_start`] started new work.
pub enum Joined<T: Clone> {
    /// No live entry existed; the returned handle is the newly registered work.
    Started(PendingHandle<T>),
    /// An earlier request with the same key is still pending.
    Existing(PendingHandle<T>),
}

/// Tracks in-flight request keys for one context.
pub struct RequestDeduplicator<T: Clone> {
    state: Arc<Mutex<DeduplicationState<T>>>,
}

impl<T: Clone> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeduplicationState {
                in_flight: HashMap::new(),
                request_timeout,
                next_generation: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeduplicationState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn request_timeout(&self) -> Duration {
        self.lock().request_timeout
    }

    /// True iff a non-stale entry exists for `key`.
    pub fn is_in_flight(&self, key: &str, now: Instant) -> bool {
        self.lock().live_entry(key, now).is_some()
    }

    /// Handle of the non-stale entry for `key`, if any.
    pub fn in_flight_handle(&self, key: &str, now: Instant) -> Option<PendingHandle<T>> {
        self.lock()
            .live_entry(key, now)
            .map(|entry| entry.handle.clone())
    }

    /// Track `handle` under `key`, starting now.
    pub fn mark_in_flight(&self, key: impl Into<String>, handle: PendingHandle<T>) {
        self.mark_in_flight_at(key, handle, Instant::now());
    }

    /// Track `handle` under `key` with an explicit start time.
    ///
    /// The entry is deleted when the handle settles. A later entry that
    /// replaced this one under the same key is left alone.
    pub fn mark_in_flight_at(
        &self,
        key: impl Into<String>,
        handle: PendingHandle<T>,
        start_time: Instant,
    ) {
        let key = key.into();
        let generation = {
            let mut state = self.lock();
            insert_entry(&mut state, key.clone(), handle.clone(), start_time)
        };
        self.spawn_settlement_watch(key, handle, start_time, generation);
    }

    /// Atomically join a live entry for `key` or register the work produced
    /// by `start`.
    pub fn join_or_start<F>(&self, key: &str, now: Instant, start: F) -> Joined<T>
    where
        F: FnOnce() -> PendingHandle<T>,
    {
        let (handle, generation) = {
            let mut state = self.lock();
            if let Some(entry) = state.live_entry(key, now) {
                return Joined::Existing(entry.handle.clone());
            }
            let handle = start();
            let generation = insert_entry(&mut state, key.to_string(), handle.clone(), now);
            (handle, generation)
        };
        self.spawn_settlement_watch(key.to_string(), handle.clone(), now, generation);
        Joined::Started(handle)
    }

    fn spawn_settlement_watch(
        &self,
        key: String,
        handle: PendingHandle<T>,
        start_time: Instant,
        generation: u64,
    ) {
        let deadline = start_time + self.request_timeout();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                // Stale from here on; cleanup owns the entry.
                tracing::trace!(key = %key, "In-flight request outlived its timeout");
                return;
            }
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state
                .in_flight
                .get(&key)
                .is_some_and(|entry| entry.generation == generation)
            {
                state.in_flight.remove(&key);
                tracing::trace!(key = %key, "In-flight request settled");
            }
        });
    }

    /// Delete and return every entry whose age is at least the timeout.
    pub fn cleanup_stale_requests(&self, now: Instant) -> HashSet<String> {
        let mut state = self.lock();
        let timeout = state.request_timeout;
        let stale: HashSet<String> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.start_time) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            state.in_flight.remove(key);
        }
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "Removed stale in-flight requests");
        }
        stale
    }

    /// Number of tracked entries, stale ones included.
    pub fn len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().in_flight.clear();
    }
}

fn insert_entry<T: Clone>(
    state: &mut DeduplicationState<T>,
    key: String,
    handle: PendingHandle<T>,
    start_time: Instant,
) -> u64 {
    let generation = state.next_generation;
    state.next_generation += 1;
    state.in_flight.insert(
        key.clone(),
        InFlightRequest {
            key,
            start_time,
            handle,
            generation,
        },
    );
    generation
}
