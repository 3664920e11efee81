//! Single-flight, equivalence-aware result cache
//!
//! [`Cache::get_or_init_call`] returns a leased [`Handle`] to the result of
//! a call, executing the compute fn at most once per (storage key,
//! concurrency key) at a time. Completed results are indexed in an
//! equivalence graph, so a later request whose inputs are known to be
//! equivalent to an earlier one's reuses its result.
//!
//! All bookkeeping happens under one lock. Compute fns, release hooks and
//! expiration store I/O always run with the lock released.

mod arbitrary;
mod egraph;
mod flight;
mod lookup;
mod result;

pub use arbitrary::{ArbitraryHandle, ArbitraryValue};
pub use result::{Handle, PostCallFn, ReleaseFn, ValueBundle};

use crate::call::{CallId, DigestHasher};
use crate::config::schema::CacheSettings;
use crate::error::{CacheError, CacheResult};
use crate::scope::{CallScope, Cancellation};
use crate::store::ExpirationStore;
use arbitrary::ArbitraryState;
use chrono::Utc;
use egraph::{EGraph, IndexFacts, ResultId, TermMatch, TermShape};
use flight::{Flight, FlightId, Woke};
use lookup::LookupRequest;
use parking_lot::Mutex;
use result::{Lease, SharedResult};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Default interval between expiration sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Identifies a call for caching
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub id: CallId,
    /// Concurrent calls are deduplicated only when this is set
    pub concurrency_key: Option<String>,
    /// Nonzero to scope the entry's storage key by TTL and session
    pub ttl_secs: u64,
    /// Run without caching or deduplication
    pub do_not_cache: bool,
}

impl CacheKey {
    pub fn new(id: CallId) -> Self {
        Self {
            id,
            concurrency_key: None,
            ttl_secs: 0,
            do_not_cache: false,
        }
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_do_not_cache(mut self, do_not_cache: bool) -> Self {
        self.do_not_cache = do_not_cache;
        self
    }
}

/// Breakdown of live entries by index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheEntryStats {
    pub ongoing_calls: usize,
    pub completed_calls: usize,
    pub ongoing_arbitrary: usize,
    pub completed_arbitrary: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    storage_key: String,
    concurrency_key: String,
}

/// Expiration update deferred until the first caller succeeds
#[derive(Debug, Clone)]
struct PendingExpiration {
    call_key: String,
    storage_key: String,
    expiration: i64,
    prev_storage_key: String,
}

struct StoragePlan {
    storage_key: String,
    expiration: i64,
    pending: Option<PendingExpiration>,
}

struct CallFlight {
    flight: Flight,
    /// Present when registered for deduplication
    key: Option<FlightKey>,
    storage_key: String,
    session_id: Option<String>,
    expiration: i64,
    pending: Option<PendingExpiration>,
    request: CallId,
    request_term: TermShape,
}

#[derive(Default)]
struct CacheState {
    ongoing: HashMap<FlightKey, FlightId>,
    calls: HashMap<FlightId, CallFlight>,
    results: HashMap<ResultId, SharedResult>,
    egraph: EGraph,
    arbitrary: ArbitraryState,
    next_id: u64,
}

impl CacheState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn flight_alive(&self, flight: Option<FlightId>) -> bool {
        flight.is_some_and(|f| self.calls.contains_key(&f))
    }

    fn unregister(&mut self, key: Option<&FlightKey>, flight: FlightId) {
        if let Some(key) = key {
            if self.ongoing.get(key) == Some(&flight) {
                self.ongoing.remove(key);
            }
        }
    }

    /// Drop a result nobody holds; returns its release hook
    /// Take a reference on a hit and merge the requester into its class
    fn lease_hit(&mut self, hit: TermMatch, request: &CallId, storage_key: &str) -> CacheResult<Leased> {
        self.egraph
            .merge_request_into_hit(hit.term, request.digest(), request.extra_digests());
        let extras = self.egraph.term_output_extras(hit.term);
        let Some(res) = self.results.get_mut(&hit.result) else {
            return Err(CacheError::Internal(format!(
                "indexed result {} is missing",
                hit.result
            )));
        };
        res.ref_count += 1;
        debug!(
            "Cache hit for {} (storage key {})",
            request.path(),
            res.storage_key
        );
        Ok(Leased {
            result: hit.result,
            id: request.with_extra_digests(&extras),
            value: res.value.clone(),
            safe_to_persist: res.safe_to_persist,
            post_call: res.post_call.clone(),
            hit_cache: true,
            hit_equivalent: res.storage_key != storage_key,
        })
    }

    fn evict(&mut self, result: ResultId) -> Option<ReleaseFn> {
        self.egraph.remove_result(result);
        self.results.remove(&result).and_then(|r| r.on_release)
    }
}

pub(crate) struct CacheInner {
    id: Uuid,
    state: Mutex<CacheState>,
    store: Option<Arc<dyn ExpirationStore>>,
    sweep_interval: Duration,
}

/// A shared, cloneable cache instance
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

/// A lease resolved under the lock, not yet turned into a [`Handle`]
struct Leased {
    result: ResultId,
    id: CallId,
    value: Option<crate::value::Value>,
    safe_to_persist: bool,
    post_call: Option<PostCallFn>,
    hit_cache: bool,
    hit_equivalent: bool,
}

enum Entry {
    Hit(Leased),
    Join(FlightId, watch::Receiver<bool>),
    Start(FlightId, watch::Receiver<bool>, watch::Sender<bool>, Cancellation),
}

/// A caller waiting on a call flight. Dropping it before it settles counts
/// as that caller canceling, so the flight never keeps a phantom waiter.
struct CallWaiter<'a> {
    inner: &'a CacheInner,
    flight_id: FlightId,
    request: &'a CallId,
    request_term: &'a TermShape,
    first: bool,
    settled: bool,
}

impl CallWaiter<'_> {
    fn settle(&mut self, woke: Woke) -> (CacheResult<Leased>, Option<ReleaseFn>) {
        self.settled = true;
        self.inner
            .settle_call(self.flight_id, woke, self.request, self.request_term, self.first)
    }
}

impl Drop for CallWaiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        trace!("Waiter for {} dropped before completion", self.request.path());
        let (_, orphan) = self.settle(Woke::Canceled(CacheError::canceled(DROPPED_WAITER)));
        spawn_release(orphan);
    }
}

/// Cancellation cause reported when a waiting future is dropped
const DROPPED_WAITER: &str = "waiter dropped";

/// Run a release hook from a synchronous context
fn spawn_release(hook: Option<ReleaseFn>) {
    let Some(hook) = hook else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                if let Err(e) = hook().await {
                    warn!("Release of abandoned entry failed: {}", e);
                }
            });
        }
        Err(_) => warn!("No runtime available to release abandoned entry"),
    }
}

fn request_shape(id: &CallId) -> TermShape {
    let (self_digest, inputs) = id.self_digest_and_inputs();
    TermShape {
        self_digest,
        inputs,
    }
}

async fn run_release(hook: Option<ReleaseFn>) -> CacheResult<()> {
    match hook {
        Some(f) => f().await,
        None => Ok(()),
    }
}

impl Cache {
    /// In-memory cache with no expiration store
    pub fn new() -> Self {
        Self::build(None, DEFAULT_SWEEP_INTERVAL)
    }

    /// Cache that persists TTL metadata in `store`
    pub fn with_store(store: Arc<dyn ExpirationStore>) -> Self {
        Self::build(Some(store), DEFAULT_SWEEP_INTERVAL)
    }

    pub fn from_settings(settings: &CacheSettings, store: Option<Arc<dyn ExpirationStore>>) -> Self {
        Self::build(store, Duration::from_secs(settings.sweep_interval_secs.max(1)))
    }

    fn build(store: Option<Arc<dyn ExpirationStore>>, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                id: Uuid::new_v4(),
                state: Mutex::new(CacheState::default()),
                store,
                sweep_interval,
            }),
        }
    }

    /// Instance id used to scope recursion markers
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn store(&self) -> Option<&Arc<dyn ExpirationStore>> {
        self.inner.store.as_ref()
    }

    /// Number of live entries across all indexes
    pub fn size(&self) -> usize {
        let state = self.inner.state.lock();
        state.ongoing.len()
            + state.results.len()
            + state.arbitrary.ongoing_len()
            + state.arbitrary.completed_len()
    }

    pub fn entry_stats(&self) -> CacheEntryStats {
        let state = self.inner.state.lock();
        CacheEntryStats {
            ongoing_calls: state.ongoing.len(),
            completed_calls: state.results.len(),
            ongoing_arbitrary: state.arbitrary.ongoing_len(),
            completed_arbitrary: state.arbitrary.completed_len(),
        }
    }

    /// Callers currently waiting on a deduplicated call
    pub fn ongoing_waiters(&self, id: &CallId, concurrency_key: &str) -> Option<usize> {
        let state = self.inner.state.lock();
        let key = FlightKey {
            storage_key: id.digest().to_string(),
            concurrency_key: concurrency_key.to_string(),
        };
        let flight = state.ongoing.get(&key)?;
        state.calls.get(flight).map(|c| c.flight.waiters)
    }

    /// Callers currently waiting on an arbitrary-value call
    pub fn ongoing_arbitrary_waiters(&self, key: &str) -> Option<usize> {
        self.inner.state.lock().arbitrary.waiters(key)
    }

    /// Periodically delete expired TTL records until `cancel` fires
    pub async fn run_expiration_sweep(&self, cancel: &Cancellation) {
        let Some(store) = self.inner.store.clone() else {
            debug!("No expiration store configured, sweep disabled");
            return;
        };

        let mut ticker = tokio::time::interval(self.inner.sweep_interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.canceled() => return,
                _ = ticker.tick() => {}
            }

            match store.gc_expired(Utc::now().timestamp()).await {
                Ok(0) => trace!("Expiration sweep found nothing to remove"),
                Ok(n) => debug!("Expiration sweep removed {} records", n),
                Err(e) => warn!("Failed to garbage collect expired calls: {}", e),
            }
        }
    }

    /// Find an existing result for `id` without executing anything.
    ///
    /// Tries the structural term first, then any result whose output
    /// carries one of `id`'s extra digests. Unlike [`Cache::get_or_init_call`]
    /// this trusts the caller's extra digests, so a content digest alone is
    /// enough to match.
    pub async fn lookup(&self, id: &CallId) -> CacheResult<Option<Handle>> {
        let storage_key = id.digest().to_string();
        let leased = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let mut candidates = state.egraph.lookup(&request_shape(id));
            if candidates.is_empty() {
                candidates = state.egraph.lookup_by_output(id.extra_digests());
            }
            let req = LookupRequest {
                ttl_secs: 0,
                now: 0,
                storage_key: &storage_key,
                session_id: None,
            };
            match lookup::select(&req, &candidates, &state.results).0 {
                Some(hit) => state.lease_hit(hit, id, &storage_key)?,
                None => {
                    trace!("No cached result for {}", id.path());
                    return Ok(None);
                }
            }
        };
        self.finish(leased).await.map(Some)
    }

    /// Return the cached result for `key`, computing it with `f` if needed.
    ///
    /// `f` receives a derived scope whose cancellation fires only after
    /// every joined caller has left.
    pub async fn get_or_init_call<F, Fut>(
        &self,
        scope: &CallScope,
        key: CacheKey,
        f: F,
    ) -> CacheResult<Handle>
    where
        F: FnOnce(CallScope) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<ValueBundle>> + Send + 'static,
    {
        if key.id.field().is_empty() {
            return Err(CacheError::InvalidKey("call id has no field".into()));
        }

        if key.do_not_cache {
            return self.run_uncached(scope, f).await;
        }

        let call_key = key.id.digest().to_string();
        let plan = self.plan_storage(scope, &call_key, key.ttl_secs).await?;

        if scope.is_in_progress(self.inner.id, &plan.storage_key) {
            return Err(CacheError::RecursiveCall);
        }

        let request_term = request_shape(&key.id);
        let session_id = scope.session_id().map(str::to_string);
        let now = if key.ttl_secs != 0 {
            Utc::now().timestamp()
        } else {
            0
        };

        let entry = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let candidates = state.egraph.lookup(&request_term);
            let req = LookupRequest {
                ttl_secs: key.ttl_secs,
                now,
                storage_key: &plan.storage_key,
                session_id: session_id.as_deref(),
            };
            let (hit, summary) = lookup::select(&req, &candidates, &state.results);

            if let Some(hit) = hit {
                Entry::Hit(state.lease_hit(hit, &key.id, &plan.storage_key)?)
            } else {
                let flight_key = key.concurrency_key.as_ref().map(|c| FlightKey {
                    storage_key: plan.storage_key.clone(),
                    concurrency_key: c.clone(),
                });

                let joined = flight_key
                    .as_ref()
                    .and_then(|k| state.ongoing.get(k).copied())
                    .and_then(|id| state.calls.get_mut(&id).map(|c| (id, c)));

                match joined {
                    Some((flight_id, call)) => {
                        call.flight.waiters += 1;
                        trace!(
                            "Joining in-flight call {} ({} waiters)",
                            key.id.path(),
                            call.flight.waiters
                        );
                        Entry::Join(flight_id, call.flight.done.clone())
                    }
                    None => {
                        let flight_id = state.next_id();
                        let (flight, tx) = Flight::new();
                        let rx = flight.done.clone();
                        let cancel = flight.cancel.clone();
                        if let Some(k) = &flight_key {
                            state.ongoing.insert(k.clone(), flight_id);
                        }
                        debug!(
                            "Cache miss for {} (storage key {}, {} rejected, {} cross-key allowed)",
                            key.id.path(),
                            plan.storage_key,
                            summary.rejected,
                            summary.mismatch_allowed
                        );
                        state.calls.insert(
                            flight_id,
                            CallFlight {
                                flight,
                                key: flight_key,
                                storage_key: plan.storage_key.clone(),
                                session_id: session_id.clone(),
                                expiration: plan.expiration,
                                pending: plan.pending.clone(),
                                request: key.id.clone(),
                                request_term: request_term.clone(),
                            },
                        );
                        Entry::Start(flight_id, rx, tx, cancel)
                    }
                }
            }
        };

        match entry {
            Entry::Hit(leased) => self.finish(leased).await,
            Entry::Join(flight_id, rx) => {
                self.wait_call(scope, flight_id, rx, &key.id, &request_term, false)
                    .await
            }
            Entry::Start(flight_id, rx, tx, cancel) => {
                let exec_scope = scope.for_execution(self.inner.id, &plan.storage_key, cancel);
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let outcome = flight::run_guarded(f(exec_scope)).await;
                    inner.complete_call(flight_id, outcome, tx).await;
                });
                self.wait_call(scope, flight_id, rx, &key.id, &request_term, true)
                    .await
            }
        }
    }

    async fn run_uncached<F, Fut>(&self, scope: &CallScope, f: F) -> CacheResult<Handle>
    where
        F: FnOnce(CallScope) -> Fut,
        Fut: Future<Output = CacheResult<ValueBundle>>,
    {
        // downstream persistence layers must never see a shared storage key
        let scope = scope.clone().with_storage_key(Uuid::new_v4().to_string());
        let bundle = f(scope).await?;

        let value = match bundle.value.as_ref().map(|v| v.for_request(&bundle.id)) {
            Some(Ok(v)) => Some(v),
            None => None,
            Some(Err(e)) => {
                if let Err(release_err) = run_release(bundle.on_release).await {
                    warn!("Release after failed normalization also failed: {}", release_err);
                }
                return Err(e);
            }
        };
        Ok(Handle {
            id: bundle.id,
            value,
            hit_cache: false,
            hit_equivalent: false,
            safe_to_persist: bundle.safe_to_persist,
            post_call: bundle.post_call,
            lease: Lease::Detached {
                on_release: bundle.on_release,
            },
        })
    }

    async fn plan_storage(
        &self,
        scope: &CallScope,
        call_key: &str,
        ttl_secs: u64,
    ) -> CacheResult<StoragePlan> {
        let plain = StoragePlan {
            storage_key: call_key.to_string(),
            expiration: 0,
            pending: None,
        };
        if ttl_secs == 0 {
            return Ok(plain);
        }
        let Some(store) = &self.inner.store else {
            return Ok(plain);
        };

        let cached = match store.select_expiration(call_key).await {
            Ok(record) => record,
            Err(e) => {
                error!("Failed to select call {} from expiration store: {}", call_key, e);
                None
            }
        };

        let now = Utc::now().timestamp();
        match cached {
            Some(record) if !record.is_expired(now) => Ok(StoragePlan {
                storage_key: record.storage_key,
                expiration: record.expiration,
                pending: None,
            }),
            previous => {
                // fresh or lapsed: a new storage key scoped to this session
                let session_id = scope.session_id().ok_or(CacheError::MissingSession)?;
                let storage_key = DigestHasher::new()
                    .with_str(call_key)
                    .with_delim()
                    .with_str(session_id)
                    .finish()
                    .to_string();
                let expiration = now + ttl_secs as i64;
                Ok(StoragePlan {
                    pending: Some(PendingExpiration {
                        call_key: call_key.to_string(),
                        storage_key: storage_key.clone(),
                        expiration,
                        prev_storage_key: previous.map(|r| r.storage_key).unwrap_or_default(),
                    }),
                    storage_key,
                    expiration,
                })
            }
        }
    }

    async fn persist(&self, pending: PendingExpiration) {
        let Some(store) = &self.inner.store else {
            return;
        };
        match store
            .set_expiration(
                &pending.call_key,
                &pending.storage_key,
                pending.expiration,
                &pending.prev_storage_key,
            )
            .await
        {
            Ok(true) => debug!(
                "Persisted expiration for {} until {}",
                pending.call_key, pending.expiration
            ),
            Ok(false) => debug!(
                "Expiration for {} was updated concurrently, keeping newer record",
                pending.call_key
            ),
            Err(e) => error!("Failed to persist cache expiration: {}", e),
        }
    }

    async fn wait_call(
        &self,
        scope: &CallScope,
        flight_id: FlightId,
        rx: watch::Receiver<bool>,
        request: &CallId,
        request_term: &TermShape,
        first: bool,
    ) -> CacheResult<Handle> {
        let mut waiter = CallWaiter {
            inner: &self.inner,
            flight_id,
            request,
            request_term,
            first,
            settled: false,
        };
        let woke = flight::wait(rx, scope.cancellation()).await;

        if first && matches!(woke, Woke::Done { .. }) {
            if let Some(pending) = self.inner.take_pending(flight_id) {
                self.persist(pending).await;
            }
        }

        let (leased, orphan) = waiter.settle(woke);
        if let Err(e) = run_release(orphan).await {
            warn!("Release of abandoned result failed: {}", e);
        }
        self.finish(leased?).await
    }

    /// Turn a lease into a handle, re-wrapping object values under the
    /// requester's identity
    async fn finish(&self, leased: Leased) -> CacheResult<Handle> {
        let value = match leased.value.as_ref().map(|v| v.for_request(&leased.id)) {
            Some(Ok(v)) => Some(v),
            None => None,
            Some(Err(e)) => {
                if let Err(release_err) = self.inner.release_result(leased.result).await {
                    warn!("Release after failed reconstruction also failed: {}", release_err);
                }
                return Err(e);
            }
        };
        Ok(Handle {
            id: leased.id,
            value,
            hit_cache: leased.hit_cache,
            hit_equivalent: leased.hit_equivalent,
            safe_to_persist: leased.safe_to_persist,
            post_call: leased.post_call,
            lease: Lease::Cached {
                cache: self.inner.clone(),
                result: leased.result,
            },
        })
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.inner.id)
            .field("stats", &self.entry_stats())
            .finish()
    }
}

impl CacheInner {
    /// Store a finished execution's outcome and wake its waiters
    async fn complete_call(
        &self,
        flight_id: FlightId,
        outcome: CacheResult<ValueBundle>,
        done: watch::Sender<bool>,
    ) {
        let abandoned = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(call) = state.calls.get_mut(&flight_id) else {
                warn!("Completed flight {} is not registered", flight_id);
                return;
            };

            if call.flight.waiters == 0 {
                // everyone left: never index, release right away
                let abandoned = state.calls.remove(&flight_id);
                debug!(
                    "Discarding result of abandoned call {}",
                    abandoned.as_ref().map(|c| c.request.path()).unwrap_or_default()
                );
                outcome.ok().and_then(|bundle| bundle.on_release)
            } else {
                match outcome {
                    Ok(bundle) => {
                        state.next_id += 1;
                        let result = state.next_id;
                        let res = SharedResult::from_bundle(
                            bundle,
                            call.storage_key.clone(),
                            call.session_id.clone(),
                            call.expiration,
                            flight_id,
                        );
                        let output_digests = [res.output_digest.clone(), res.output_eq_digest.clone()];
                        state.egraph.index(
                            result,
                            &IndexFacts {
                                request_digest: call.request.digest(),
                                request_extras: call.request.extra_digests(),
                                output_digests: &output_digests,
                                output_extras: &res.output_extras,
                                request_term: &call.request_term,
                                result_term: (!res.cache_backed).then_some(&res.result_term),
                            },
                        );
                        state.results.insert(result, res);
                        call.flight.outcome = Some(Ok(result));
                    }
                    Err(e) => {
                        debug!("Call {} failed: {}", call.request.path(), e);
                        call.flight.outcome = Some(Err(e));
                    }
                }
                let key = call.key.clone();
                state.unregister(key.as_ref(), flight_id);
                None
            }
        };

        // waiters may all be gone already
        let _ = done.send(true);
        if let Err(e) = run_release(abandoned).await {
            warn!("Release of abandoned result failed: {}", e);
        }
    }

    /// Hand the TTL write to the first waiter once its flight succeeded with
    /// a persistable result
    fn take_pending(&self, flight_id: FlightId) -> Option<PendingExpiration> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let call = state.calls.get_mut(&flight_id)?;
        let Some(Ok(result)) = call.flight.outcome else {
            return None;
        };
        if !state.results.get(&result).is_some_and(|r| r.safe_to_persist) {
            return None;
        }
        call.pending.take()
    }

    /// Leave a flight after waking, leasing its result on success.
    /// Also returns the release hook of a result left with no holders.
    fn settle_call(
        &self,
        flight_id: FlightId,
        woke: Woke,
        request: &CallId,
        request_term: &TermShape,
        first: bool,
    ) -> (CacheResult<Leased>, Option<ReleaseFn>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(call) = state.calls.get_mut(&flight_id) else {
            return (
                Err(CacheError::Internal(format!("flight {} vanished", flight_id))),
                None,
            );
        };
        let (observed, already) = match woke {
            Woke::Done { already } => (call.flight.observed(), already),
            Woke::Canceled(e) => (Err(e), false),
        };
        let last = call.flight.leave(&flight::leave_cause(&observed));
        let completed = call.flight.is_complete();
        let flight_outcome = call.flight.outcome.clone();
        let flight_key = call.key.clone();
        if last && completed {
            state.calls.remove(&flight_id);
        }
        if last || observed.is_ok() {
            state.unregister(flight_key.as_ref(), flight_id);
        }

        match observed {
            Ok(result) => {
                let Some(res) = state.results.get_mut(&result) else {
                    return (
                        Err(CacheError::Internal(format!("result {} vanished", result))),
                        None,
                    );
                };
                res.ref_count += 1;
                if last {
                    res.flight = None;
                }
                let output_digests = [res.output_digest.clone(), res.output_eq_digest.clone()];
                state.egraph.index(
                    result,
                    &IndexFacts {
                        request_digest: request.digest(),
                        request_extras: request.extra_digests(),
                        output_digests: &output_digests,
                        output_extras: &res.output_extras,
                        request_term,
                        result_term: (!res.cache_backed).then_some(&res.result_term),
                    },
                );
                let leased = Leased {
                    result,
                    id: request.with_extra_digests(&res.output_extras),
                    value: res.value.clone(),
                    safe_to_persist: res.safe_to_persist,
                    post_call: res.post_call.clone(),
                    hit_cache: already && !first,
                    hit_equivalent: false,
                };
                (Ok(leased), None)
            }
            Err(e) => {
                let mut orphan = None;
                if last {
                    if let Some(Ok(result)) = flight_outcome {
                        // completed while the last waiter was leaving
                        match state.results.get_mut(&result) {
                            Some(res) if res.ref_count == 0 => orphan = state.evict(result),
                            Some(res) => res.flight = None,
                            None => {}
                        }
                    }
                }
                trace!("Call {} returned error to waiter: {}", request.path(), e);
                (Err(e), orphan)
            }
        }
    }

    /// Drop one reference to a result
    pub(crate) async fn release_result(&self, result: ResultId) -> CacheResult<()> {
        let hook = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(res) = state.results.get_mut(&result) else {
                debug!("Release of unknown result {}", result);
                return Ok(());
            };
            res.ref_count = res.ref_count.saturating_sub(1);
            let flight = res.flight;
            if res.ref_count > 0 || state.flight_alive(flight) {
                None
            } else {
                state.evict(result)
            }
        };
        run_release(hook).await
    }
}
