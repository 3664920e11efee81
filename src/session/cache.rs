//! Session cache: tracks every handle a client session acquires so they
//! can be released together when the session ends.

use crate::cache::{ArbitraryHandle, ArbitraryValue, Cache, CacheEntryStats, CacheKey, Handle, ValueBundle};
use crate::error::{CacheError, CacheResult};
use crate::scope::CallScope;
use crate::session::telemetry::Telemetry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct SessionState {
    closed: bool,
    calls: Vec<Handle>,
    arbitrary: Vec<ArbitraryHandle>,
    /// Keys whose telemetry was already emitted
    seen: HashSet<String>,
    /// Keys whose most recent attempt failed
    errored: HashSet<String>,
}

/// Session-scoped wrapper around a shared [`Cache`].
///
/// Handles returned from this type are non-owning views; the session owns
/// the leases until [`SessionCache::release_and_close`].
#[derive(Clone)]
pub struct SessionCache {
    cache: Cache,
    state: Arc<Mutex<SessionState>>,
}

impl SessionCache {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn size(&self) -> usize {
        self.cache.size()
    }

    pub fn entry_stats(&self) -> CacheEntryStats {
        self.cache.entry_stats()
    }

    /// Number of leases this session still holds
    pub fn tracked(&self) -> usize {
        let state = self.state.lock();
        state.calls.len() + state.arbitrary.len()
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.state.lock().closed {
            return Err(CacheError::SessionClosed);
        }
        Ok(())
    }

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
        self.call(scope, key, None, f).await
    }

    /// Like [`SessionCache::get_or_init_call`], reporting the call to
    /// `telemetry` the first time this session sees its key
    pub async fn get_or_init_call_traced<F, Fut>(
        &self,
        scope: &CallScope,
        key: CacheKey,
        telemetry: &dyn Telemetry,
        f: F,
    ) -> CacheResult<Handle>
    where
        F: FnOnce(CallScope) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<ValueBundle>> + Send + 'static,
    {
        self.call(scope, key, Some(telemetry), f).await
    }

    async fn call<F, Fut>(
        &self,
        scope: &CallScope,
        key: CacheKey,
        telemetry: Option<&dyn Telemetry>,
        f: F,
    ) -> CacheResult<Handle>
    where
        F: FnOnce(CallScope) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<ValueBundle>> + Send + 'static,
    {
        self.ensure_open()?;

        let call_key = key.id.digest().to_string();
        let emit = telemetry.filter(|_| self.should_emit(&key, &call_key, scope));
        if let Some(t) = emit {
            t.begin(&key.id);
        }

        // nested calls report their own telemetry normally
        let inner_scope = scope.clone().without_repeated_telemetry();
        let retry = !key.do_not_cache && self.state.lock().errored.contains(&call_key);
        let outcome = if retry {
            self.retry_errored(&inner_scope, key.clone(), f).await
        } else {
            self.cache.get_or_init_call(&inner_scope, key.clone(), f).await
        };

        if let Some(t) = emit {
            let cached = outcome.as_ref().is_ok_and(Handle::hit_cache);
            t.done(&key.id, cached, outcome.as_ref().err());
        }

        let handle = match outcome {
            Ok(handle) => handle,
            Err(e) => {
                if !key.do_not_cache {
                    self.state.lock().errored.insert(call_key);
                }
                return Err(e);
            }
        };

        if key.do_not_cache {
            return Ok(handle);
        }

        let rejected = {
            let mut state = self.state.lock();
            state.errored.remove(&call_key);
            if !state.closed {
                let view = handle.share();
                state.calls.push(handle);
                return Ok(view);
            }
            handle
        };

        if let Err(e) = rejected.release().await {
            warn!("Failed to release result of call finished after close: {}", e);
        }
        Err(CacheError::SessionClosedDuringExecution)
    }

    fn should_emit(&self, key: &CacheKey, call_key: &str, scope: &CallScope) -> bool {
        if key.do_not_cache || scope.repeated_telemetry() {
            return true;
        }
        self.state.lock().seen.insert(call_key.to_string())
    }

    /// Force a previously failed key through the uncached path, then store
    /// a success under the original key
    async fn retry_errored<F, Fut>(&self, scope: &CallScope, key: CacheKey, f: F) -> CacheResult<Handle>
    where
        F: FnOnce(CallScope) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<ValueBundle>> + Send + 'static,
    {
        debug!("Retrying previously failed call {} uncached", key.id.path());
        let bypass = key.clone().with_do_not_cache(true);
        let fresh = self.cache.get_or_init_call(scope, bypass, f).await?;

        let slot = Arc::new(Mutex::new(Some(fresh)));
        let pending = slot.clone();
        let stored = self
            .cache
            .get_or_init_call(scope, key, move |_| async move {
                let handle = pending.lock().take();
                handle
                    .map(ValueBundle::from_handle)
                    .ok_or_else(|| CacheError::Internal("retried result was already stored".into()))
            })
            .await;

        // someone else stored the key first
        let unused = slot.lock().take();
        if let Some(handle) = unused {
            if let Err(e) = handle.release().await {
                warn!("Failed to release unused retry result: {}", e);
            }
        }
        stored
    }

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
        self.ensure_open()?;
        let handle = self.cache.get_or_init_arbitrary(scope, key, f).await?;

        let rejected = {
            let mut state = self.state.lock();
            if !state.closed {
                let view = handle.share();
                state.arbitrary.push(handle);
                return Ok(view);
            }
            handle
        };

        if let Err(e) = rejected.release().await {
            warn!("Failed to release arbitrary value finished after close: {}", e);
        }
        Err(CacheError::SessionClosedDuringExecution)
    }

    /// Release every tracked lease once and refuse further calls.
    /// All release failures are joined into the returned error.
    pub async fn release_and_close(&self) -> CacheResult<()> {
        let (calls, arbitrary) = {
            let mut state = self.state.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.calls),
                std::mem::take(&mut state.arbitrary),
            )
        };

        let released = calls.len() + arbitrary.len();
        let mut errors = Vec::new();
        for handle in calls {
            if let Err(e) = handle.release().await {
                errors.push(e);
            }
        }
        for handle in arbitrary {
            if let Err(e) = handle.release().await {
                errors.push(e);
            }
        }

        debug!("Closed session cache, released {} leases", released);
        CacheError::join(errors)
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("closed", &self.is_closed())
            .field("tracked", &self.tracked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(CallId::root("Int", name))
    }

    fn int_fn(
        id: CallId,
        n: i64,
    ) -> impl FnOnce(CallScope) -> std::future::Ready<CacheResult<ValueBundle>> + Send + 'static {
        move |_| std::future::ready(Ok(ValueBundle::new(id, n)))
    }

    #[tokio::test]
    async fn close_releases_only_own_leases() {
        let base = Cache::new();
        let sc1 = SessionCache::new(base.clone());
        let sc2 = SessionCache::new(base.clone());
        let scope = CallScope::new();

        let (k1, k2, k3) = (key("one"), key("two"), key("three"));
        sc1.get_or_init_call(&scope, k1.clone(), int_fn(k1.id.clone(), 1)).await.unwrap();
        sc1.get_or_init_call(&scope, k2.clone(), int_fn(k2.id.clone(), 2)).await.unwrap();
        assert_eq!(base.size(), 2);

        sc2.get_or_init_call(&scope, k2.clone(), int_fn(k2.id.clone(), 2)).await.unwrap();
        sc2.get_or_init_call(&scope, k3.clone(), int_fn(k3.id.clone(), 3)).await.unwrap();
        assert_eq!(base.size(), 3);

        sc1.release_and_close().await.unwrap();
        assert_eq!(base.size(), 2);

        let closed = key("closed");
        let err = sc1
            .get_or_init_call(&scope, closed.clone(), int_fn(closed.id.clone(), 9))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "session cache is closed");
        assert_eq!(base.size(), 2);

        sc2.release_and_close().await.unwrap();
        assert_eq!(base.size(), 0);
    }

    #[tokio::test]
    async fn close_during_execution_releases_result() {
        let base = Cache::new();
        let sc = SessionCache::new(base.clone());
        let scope = CallScope::new();

        let k1 = key("before");
        sc.get_or_init_call(&scope, k1.clone(), int_fn(k1.id.clone(), 1)).await.unwrap();
        assert_eq!(base.size(), 1);

        let (started_tx, started_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = {
            let sc = sc.clone();
            let k2 = key("running");
            tokio::spawn(async move {
                let id = k2.id.clone();
                sc.get_or_init_call(&CallScope::new(), k2, move |_| async move {
                    let _ = started_tx.send(());
                    let _ = stop_rx.await;
                    Ok(ValueBundle::new(id, 2i64))
                })
                .await
            })
        };

        started_rx.await.unwrap();
        sc.release_and_close().await.unwrap();
        stop_tx.send(()).unwrap();

        let err = running.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "session cache was closed during execution");
        assert_eq!(base.size(), 0);
    }

    #[tokio::test]
    async fn failure_then_success_is_cached() {
        let base = Cache::new();
        let sc = SessionCache::new(base.clone());
        let scope = CallScope::new();
        let k = key("flaky");
        let calls = Arc::new(AtomicUsize::new(0));

        let attempt = |fail: bool| {
            let calls = calls.clone();
            let id = k.id.clone();
            move |_: CallScope| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(CacheError::msg("boom"))
                } else {
                    Ok(ValueBundle::new(id, 99i64))
                }
            }
        };

        assert!(sc.get_or_init_call(&scope, k.clone(), attempt(true)).await.is_err());
        assert!(sc.get_or_init_call(&scope, k.clone(), attempt(true)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let res = sc.get_or_init_call(&scope, k.clone(), attempt(false)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!res.hit_cache());
        assert_eq!(res.value().and_then(|v| v.as_int()), Some(99));

        let res = sc.get_or_init_call(&scope, k.clone(), attempt(true)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(res.hit_cache());
        assert_eq!(res.value().and_then(|v| v.as_int()), Some(99));
        assert_eq!(base.size(), 1);

        sc.release_and_close().await.unwrap();
        assert_eq!(base.size(), 0);
    }

    #[tokio::test]
    async fn failure_then_nil_stays_nil() {
        let base = Cache::new();
        let sc = SessionCache::new(base.clone());
        let scope = CallScope::new();
        let k = key("nil");

        let err = sc
            .get_or_init_call(&scope, k.clone(), |_| async { Err::<ValueBundle, _>(CacheError::msg("boom")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        let id = k.id.clone();
        let res = sc
            .get_or_init_call(&scope, k.clone(), move |_| async move { Ok(ValueBundle::nil(id)) })
            .await
            .unwrap();
        assert!(!res.has_value());

        let res = sc
            .get_or_init_call(&scope, k.clone(), int_fn(k.id.clone(), 42))
            .await
            .unwrap();
        assert!(!res.has_value());
        assert!(res.hit_cache());
        assert_eq!(base.size(), 1);
    }

    #[tokio::test]
    async fn uncached_results_are_not_tracked() {
        let base = Cache::new();
        let sc = SessionCache::new(base.clone());
        let released = Arc::new(AtomicUsize::new(0));
        let k = key("untracked").with_do_not_cache(true);

        let counter = released.clone();
        let id = k.id.clone();
        let res = sc
            .get_or_init_call(&CallScope::new(), k, move |_| async move {
                Ok(ValueBundle::new(id, 1i64).with_on_release(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            })
            .await
            .unwrap();

        sc.release_and_close().await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);

        res.release().await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct Recorder {
        begins: AtomicUsize,
        cached: Mutex<Vec<bool>>,
    }

    impl Telemetry for Recorder {
        fn begin(&self, _id: &CallId) {
            self.begins.fetch_add(1, Ordering::SeqCst);
        }

        fn done(&self, _id: &CallId, cached: bool, _error: Option<&CacheError>) {
            self.cached.lock().push(cached);
        }
    }

    #[tokio::test]
    async fn telemetry_is_emitted_once_per_key() {
        let sc = SessionCache::new(Cache::new());
        let recorder = Recorder::default();
        let scope = CallScope::new();
        let k = key("telemetry");
        let unexpected = |_: CallScope| async { Err::<ValueBundle, _>(CacheError::msg("unexpected initializer call")) };

        sc.get_or_init_call_traced(&scope, k.clone(), &recorder, int_fn(k.id.clone(), 1))
            .await
            .unwrap();
        sc.get_or_init_call_traced(&scope, k.clone(), &recorder, unexpected)
            .await
            .unwrap();
        sc.get_or_init_call_traced(
            &scope,
            k.clone().with_do_not_cache(true),
            &recorder,
            int_fn(k.id.clone(), 2),
        )
        .await
        .unwrap();

        let repeated = scope.clone().with_repeated_telemetry();
        sc.get_or_init_call_traced(&repeated, k.clone(), &recorder, unexpected)
            .await
            .unwrap();

        assert_eq!(recorder.begins.load(Ordering::SeqCst), 3);
        assert_eq!(*recorder.cached.lock(), vec![false, false, true]);
    }

    #[tokio::test]
    async fn arbitrary_values_follow_session_lifecycle() {
        let base = Cache::new();
        let sc1 = SessionCache::new(base.clone());
        let sc2 = SessionCache::new(base.clone());
        let scope = CallScope::new();
        let value = |s: &'static str| move |_: CallScope| async move { Ok(ArbitraryValue::new(s)) };

        let res = sc1.get_or_init_arbitrary(&scope, "one", value("a")).await.unwrap();
        assert!(!res.hit_cache());
        assert_eq!(res.downcast::<&str>(), Some(&"a"));
        sc1.get_or_init_arbitrary(&scope, "two", value("b")).await.unwrap();
        assert_eq!(base.size(), 2);

        let res = sc2.get_or_init_arbitrary(&scope, "two", value("ignored")).await.unwrap();
        assert!(res.hit_cache());
        assert_eq!(res.downcast::<&str>(), Some(&"b"));
        sc2.get_or_init_arbitrary(&scope, "three", value("c")).await.unwrap();
        assert_eq!(base.size(), 3);

        sc1.release_and_close().await.unwrap();
        assert_eq!(base.size(), 2);
        let err = sc1.get_or_init_arbitrary(&scope, "closed", value("x")).await.unwrap_err();
        assert!(matches!(err, CacheError::SessionClosed));

        sc2.release_and_close().await.unwrap();
        assert_eq!(base.size(), 0);
    }

    #[tokio::test]
    async fn arbitrary_close_during_execution() {
        let base = Cache::new();
        let sc = SessionCache::new(base.clone());
        sc.get_or_init_arbitrary(&CallScope::new(), "base", |_| async { Ok(ArbitraryValue::new(1u8)) })
            .await
            .unwrap();
        assert_eq!(base.size(), 1);

        let (started_tx, started_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = {
            let sc = sc.clone();
            tokio::spawn(async move {
                sc.get_or_init_arbitrary(&CallScope::new(), "running", move |_| async move {
                    let _ = started_tx.send(());
                    let _ = stop_rx.await;
                    Ok(ArbitraryValue::new(2u8))
                })
                .await
            })
        };

        started_rx.await.unwrap();
        sc.release_and_close().await.unwrap();
        stop_tx.send(()).unwrap();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::SessionClosedDuringExecution));
        assert_eq!(base.size(), 0);
    }
}
