//! Single-flight store for opaque values keyed by string
//!
//! No equivalence graph: a key either has a completed entry, an ongoing
//! execution, or nothing.

use crate::cache::flight::{self, Flight, FlightId, Woke};
use crate::cache::result::ReleaseFn;
use crate::cache::{run_release, spawn_release, Cache, CacheInner, DROPPED_WAITER};
use crate::error::{CacheError, CacheResult};
use crate::scope::CallScope;
use crate::value::Payload;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// What an arbitrary compute fn returns
pub struct ArbitraryValue {
    value: Payload,
    on_release: Option<ReleaseFn>,
}

impl ArbitraryValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_payload(Arc::new(value))
    }

    pub fn from_payload(value: Payload) -> Self {
        Self {
            value,
            on_release: None,
        }
    }

    pub fn with_on_release<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<()>> + Send + 'static,
    {
        self.on_release = Some(Box::new(move || f().boxed()));
        self
    }
}

enum ArbitraryLease {
    Cached { cache: Arc<CacheInner>, entry: u64 },
    View,
}

/// A leased arbitrary value; release exactly once
pub struct ArbitraryHandle {
    key: String,
    value: Payload,
    hit_cache: bool,
    lease: ArbitraryLease,
}

impl ArbitraryHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Payload {
        &self.value
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn hit_cache(&self) -> bool {
        self.hit_cache
    }

    /// Non-owning view of the same value
    pub fn share(&self) -> ArbitraryHandle {
        ArbitraryHandle {
            key: self.key.clone(),
            value: self.value.clone(),
            hit_cache: self.hit_cache,
            lease: ArbitraryLease::View,
        }
    }

    pub async fn release(self) -> CacheResult<()> {
        match self.lease {
            ArbitraryLease::Cached { cache, entry } => cache.release_arbitrary(entry).await,
            ArbitraryLease::View => Ok(()),
        }
    }
}

impl fmt::Debug for ArbitraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArbitraryHandle")
            .field("key", &self.key)
            .field("hit_cache", &self.hit_cache)
            .finish_non_exhaustive()
    }
}

struct ArbitraryEntry {
    key: String,
    value: Payload,
    on_release: Option<ReleaseFn>,
    ref_count: usize,
    flight: Option<FlightId>,
}

struct ArbitraryFlight {
    flight: Flight,
    key: String,
}

#[derive(Default)]
pub(crate) struct ArbitraryState {
    ongoing: HashMap<String, FlightId>,
    flights: HashMap<FlightId, ArbitraryFlight>,
    completed: HashMap<String, u64>,
    entries: HashMap<u64, ArbitraryEntry>,
    next_id: u64,
}

impl ArbitraryState {
    pub fn ongoing_len(&self) -> usize {
        self.ongoing.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn waiters(&self, key: &str) -> Option<usize> {
        let flight = self.ongoing.get(key)?;
        self.flights.get(flight).map(|f| f.flight.waiters)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn unregister(&mut self, key: &str, flight: FlightId) {
        if self.ongoing.get(key) == Some(&flight) {
            self.ongoing.remove(key);
        }
    }

    fn evict(&mut self, entry: u64) -> Option<ReleaseFn> {
        let removed = self.entries.remove(&entry)?;
        if self.completed.get(&removed.key) == Some(&entry) {
            self.completed.remove(&removed.key);
        }
        removed.on_release
    }
}

enum ArbitraryEntryState {
    Hit(ArbitraryHandle),
    Join(FlightId, watch::Receiver<bool>),
    Start(FlightId, watch::Receiver<bool>, watch::Sender<bool>, CallScope),
}

impl Cache {
    /// Return the value cached under `key`, computing it with `f` if needed.
    /// Concurrent callers for the same key always share one execution.
    pub async fn get_or_init_arbitrary<F, Fut>(
        &self,
        scope: &CallScope,
        key: &str,
        f: F,
    ) -> CacheResult<ArbitraryHandle>
    where
        F: FnOnce(CallScope) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<ArbitraryValue>> + Send + 'static,
    {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("arbitrary key is empty".into()));
        }
        let storage_key = format!("arbitrary:{}", key);
        if scope.is_in_progress(self.inner.id, &storage_key) {
            return Err(CacheError::RecursiveCall);
        }

        let entry = {
            let mut guard = self.inner.state.lock();
            let state = &mut guard.arbitrary;

            let completed = state.completed.get(key).copied();
            if let Some(entry) = completed.and_then(|id| state.entries.get_mut(&id).map(|e| (id, e))) {
                let (id, entry) = entry;
                entry.ref_count += 1;
                debug!("Arbitrary cache hit for {}", key);
                ArbitraryEntryState::Hit(ArbitraryHandle {
                    key: key.to_string(),
                    value: entry.value.clone(),
                    hit_cache: true,
                    lease: ArbitraryLease::Cached {
                        cache: self.inner.clone(),
                        entry: id,
                    },
                })
            } else {
                let ongoing = state.ongoing.get(key).copied();
                match ongoing.and_then(|id| state.flights.get_mut(&id).map(|f| (id, f))) {
                    Some((id, f)) => {
                        f.flight.waiters += 1;
                        ArbitraryEntryState::Join(id, f.flight.done.clone())
                    }
                    None => {
                        let id = state.next_id();
                        let (flight, tx) = Flight::new();
                        let rx = flight.done.clone();
                        let exec = scope.for_execution(self.inner.id, &storage_key, flight.cancel.clone());
                        state.ongoing.insert(key.to_string(), id);
                        state.flights.insert(
                            id,
                            ArbitraryFlight {
                                flight,
                                key: key.to_string(),
                            },
                        );
                        ArbitraryEntryState::Start(id, rx, tx, exec)
                    }
                }
            }
        };

        match entry {
            ArbitraryEntryState::Hit(handle) => Ok(handle),
            ArbitraryEntryState::Join(id, rx) => self.wait_arbitrary(scope, id, rx, key, false).await,
            ArbitraryEntryState::Start(id, rx, tx, exec) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let outcome = flight::run_guarded(f(exec)).await;
                    inner.complete_arbitrary(id, outcome, tx).await;
                });
                self.wait_arbitrary(scope, id, rx, key, true).await
            }
        }
    }

    async fn wait_arbitrary(
        &self,
        scope: &CallScope,
        flight_id: FlightId,
        rx: watch::Receiver<bool>,
        key: &str,
        first: bool,
    ) -> CacheResult<ArbitraryHandle> {
        let mut waiter = ArbitraryWaiter {
            inner: &self.inner,
            flight_id,
            key,
            first,
            settled: false,
        };
        let woke = flight::wait(rx, scope.cancellation()).await;
        let (outcome, orphan) = waiter.settle(woke);

        if let Err(e) = run_release(orphan).await {
            warn!("Release of abandoned arbitrary value failed: {}", e);
        }
        let (entry, value, hit_cache) = outcome?;
        Ok(ArbitraryHandle {
            key: key.to_string(),
            value,
            hit_cache,
            lease: ArbitraryLease::Cached {
                cache: self.inner.clone(),
                entry,
            },
        })
    }
}

/// Leased entry id, its value, and whether it counts as a cache hit
type Settled = (CacheResult<(u64, Payload, bool)>, Option<ReleaseFn>);

/// Leaves the flight on drop unless the caller already settled
struct ArbitraryWaiter<'a> {
    inner: &'a CacheInner,
    flight_id: FlightId,
    key: &'a str,
    first: bool,
    settled: bool,
}

impl ArbitraryWaiter<'_> {
    fn settle(&mut self, woke: Woke) -> Settled {
        self.settled = true;
        self.inner
            .settle_arbitrary(self.flight_id, woke, self.key, self.first)
    }
}

impl Drop for ArbitraryWaiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        trace!("Arbitrary waiter for {} dropped before completion", self.key);
        let (_, orphan) = self.settle(Woke::Canceled(CacheError::canceled(DROPPED_WAITER)));
        spawn_release(orphan);
    }
}

impl CacheInner {
    async fn complete_arbitrary(
        &self,
        flight_id: FlightId,
        outcome: CacheResult<ArbitraryValue>,
        done: watch::Sender<bool>,
    ) {
        let abandoned = {
            let mut guard = self.state.lock();
            let state = &mut guard.arbitrary;

            let Some(f) = state.flights.get_mut(&flight_id) else {
                warn!("Completed arbitrary flight {} is not registered", flight_id);
                return;
            };
            let key = f.key.clone();

            if f.flight.waiters == 0 {
                state.flights.remove(&flight_id);
                debug!("Discarding arbitrary value of abandoned call {}", key);
                outcome.ok().and_then(|v| v.on_release)
            } else {
                match outcome {
                    Ok(value) => {
                        let id = state.next_id();
                        state.entries.insert(
                            id,
                            ArbitraryEntry {
                                key: key.clone(),
                                value: value.value,
                                on_release: value.on_release,
                                ref_count: 0,
                                flight: Some(flight_id),
                            },
                        );
                        state.completed.insert(key.clone(), id);
                        if let Some(f) = state.flights.get_mut(&flight_id) {
                            f.flight.outcome = Some(Ok(id));
                        }
                    }
                    Err(e) => {
                        debug!("Arbitrary call {} failed: {}", key, e);
                        f.flight.outcome = Some(Err(e));
                    }
                }
                state.unregister(&key, flight_id);
                None
            }
        };

        let _ = done.send(true);
        if let Err(e) = run_release(abandoned).await {
            warn!("Release of abandoned arbitrary value failed: {}", e);
        }
    }

    fn settle_arbitrary(&self, flight_id: FlightId, woke: Woke, key: &str, first: bool) -> Settled {
        let mut guard = self.state.lock();
        let state = &mut guard.arbitrary;

        let Some(f) = state.flights.get_mut(&flight_id) else {
            return (
                Err(CacheError::Internal(format!("flight {} vanished", flight_id))),
                None,
            );
        };
        let (observed, already) = match woke {
            Woke::Done { already } => (f.flight.observed(), already),
            Woke::Canceled(e) => (Err(e), false),
        };
        let last = f.flight.leave(&flight::leave_cause(&observed));
        let completed = f.flight.is_complete();
        let flight_outcome = f.flight.outcome.clone();
        if last {
            if completed {
                state.flights.remove(&flight_id);
            }
            state.unregister(key, flight_id);
        }

        match observed {
            Ok(id) => match state.entries.get_mut(&id) {
                Some(entry) => {
                    entry.ref_count += 1;
                    if last {
                        entry.flight = None;
                    }
                    (Ok((id, entry.value.clone(), already && !first)), None)
                }
                None => (
                    Err(CacheError::Internal(format!("arbitrary entry {} vanished", id))),
                    None,
                ),
            },
            Err(e) => {
                let mut orphan = None;
                if let (true, Some(Ok(id))) = (last, flight_outcome) {
                    match state.entries.get_mut(&id) {
                        Some(entry) if entry.ref_count == 0 => orphan = state.evict(id),
                        Some(entry) => entry.flight = None,
                        None => {}
                    }
                }
                trace!("Arbitrary call {} returned error to waiter: {}", key, e);
                (Err(e), orphan)
            }
        }
    }

    pub(crate) async fn release_arbitrary(&self, entry: u64) -> CacheResult<()> {
        let hook = {
            let mut guard = self.state.lock();
            let state = &mut guard.arbitrary;

            let Some(e) = state.entries.get_mut(&entry) else {
                debug!("Release of unknown arbitrary entry {}", entry);
                return Ok(());
            };
            e.ref_count = e.ref_count.saturating_sub(1);
            let alive = e.flight.is_some_and(|f| state.flights.contains_key(&f));
            if e.ref_count > 0 || alive {
                None
            } else {
                state.evict(entry)
            }
        };
        run_release(hook).await
    }
}
