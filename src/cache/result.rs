//! Cached results and the handles that lease them

use crate::cache::egraph::{ResultId, TermShape};
use crate::cache::CacheInner;
use crate::call::{Digest, CallId, ExtraDigest};
use crate::error::CacheResult;
use crate::value::Value;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// One-shot hook run when the last lease on a value is released
pub type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, CacheResult<()>> + Send>;

/// Side effect a caller may run after receiving a value
pub type PostCallFn = Arc<dyn Fn() -> BoxFuture<'static, CacheResult<()>> + Send + Sync>;

/// What a compute fn returns
pub struct ValueBundle {
    pub(crate) value: Option<Value>,
    pub(crate) id: CallId,
    pub(crate) safe_to_persist: bool,
    pub(crate) post_call: Option<PostCallFn>,
    pub(crate) on_release: Option<ReleaseFn>,
    /// Ownership of another cache entry was transferred into this bundle
    pub(crate) cache_backed: bool,
}

impl ValueBundle {
    pub fn new(id: CallId, value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            id,
            safe_to_persist: false,
            post_call: None,
            on_release: None,
            cache_backed: false,
        }
    }

    /// A successful result that materialized to nothing
    pub fn nil(id: CallId) -> Self {
        Self {
            value: None,
            id,
            safe_to_persist: false,
            post_call: None,
            on_release: None,
            cache_backed: false,
        }
    }

    /// Take over a handle returned by a nested cache call.
    ///
    /// The bundle's release hook becomes the handle's release, so the inner
    /// entry stays alive for as long as the outer one does.
    pub fn from_handle(handle: Handle) -> Self {
        let cache_backed = handle.is_cache_backed();
        let value = handle.value.clone();
        let id = handle.id.clone();
        let safe_to_persist = handle.safe_to_persist;
        let post_call = handle.post_call.clone();
        Self {
            value,
            id,
            safe_to_persist,
            post_call,
            on_release: Some(Box::new(move || handle.release().boxed())),
            cache_backed,
        }
    }

    pub fn with_safe_to_persist(mut self, safe: bool) -> Self {
        self.safe_to_persist = safe;
        self
    }

    pub fn with_post_call<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<()>> + Send + 'static,
    {
        self.post_call = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn with_on_release<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<()>> + Send + 'static,
    {
        self.on_release = Some(Box::new(move || f().boxed()));
        self
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

impl fmt::Debug for ValueBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueBundle")
            .field("id", &self.id)
            .field("value", &self.value)
            .field("safe_to_persist", &self.safe_to_persist)
            .field("cache_backed", &self.cache_backed)
            .finish_non_exhaustive()
    }
}

/// A completed execution owned by the cache
pub(crate) struct SharedResult {
    pub value: Option<Value>,
    pub post_call: Option<PostCallFn>,
    pub on_release: Option<ReleaseFn>,
    pub safe_to_persist: bool,
    pub cache_backed: bool,

    pub storage_key: String,
    pub session_id: Option<String>,
    /// Unix seconds; 0 when the entry has no TTL
    pub expiration: i64,

    pub output_digest: Digest,
    pub output_eq_digest: Digest,
    pub output_extras: Vec<ExtraDigest>,
    pub result_term: TermShape,

    pub ref_count: usize,
    /// Flight whose waiters have not all observed this result yet
    pub flight: Option<u64>,
}

impl SharedResult {
    pub fn from_bundle(
        bundle: ValueBundle,
        storage_key: String,
        session_id: Option<String>,
        expiration: i64,
        flight: u64,
    ) -> Self {
        let (self_digest, inputs) = bundle.id.self_digest_and_inputs();
        Self {
            output_digest: bundle.id.digest().clone(),
            output_eq_digest: bundle.id.output_equivalent_digest(),
            output_extras: bundle.id.extra_digests().to_vec(),
            result_term: TermShape {
                self_digest,
                inputs,
            },
            value: bundle.value,
            post_call: bundle.post_call,
            on_release: bundle.on_release,
            safe_to_persist: bundle.safe_to_persist,
            cache_backed: bundle.cache_backed,
            storage_key,
            session_id,
            expiration,
            ref_count: 0,
            flight: Some(flight),
        }
    }
}

pub(crate) enum Lease {
    /// Counted reference to a cache entry
    Cached { cache: Arc<CacheInner>, result: ResultId },
    /// Sole owner of a value that never entered the cache
    Detached { on_release: Option<ReleaseFn> },
    /// Borrowed view; releasing it does nothing
    View,
}

/// A leased result.
///
/// Handles are move-only; every owning handle must be released exactly once
/// with [`Handle::release`]. [`Handle::share`] hands out non-owning views.
pub struct Handle {
    pub(crate) id: CallId,
    pub(crate) value: Option<Value>,
    pub(crate) hit_cache: bool,
    pub(crate) hit_equivalent: bool,
    pub(crate) safe_to_persist: bool,
    pub(crate) post_call: Option<PostCallFn>,
    pub(crate) lease: Lease,
}

impl Handle {
    /// Identity of the request this handle answers
    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// False when the call succeeded with a nil result
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn hit_cache(&self) -> bool {
        self.hit_cache
    }

    /// Hit through an equivalent entry stored under a different storage key
    pub fn hit_equivalent(&self) -> bool {
        self.hit_equivalent
    }

    pub fn is_safe_to_persist(&self) -> bool {
        self.safe_to_persist
    }

    /// True when this handle holds a counted reference to a cache entry
    pub fn is_cache_backed(&self) -> bool {
        matches!(self.lease, Lease::Cached { .. })
    }

    /// Run the post-call hook, if any
    pub async fn post_call(&self) -> CacheResult<()> {
        match &self.post_call {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    /// Non-owning view of the same value
    pub fn share(&self) -> Handle {
        Handle {
            id: self.id.clone(),
            value: self.value.clone(),
            hit_cache: self.hit_cache,
            hit_equivalent: self.hit_equivalent,
            safe_to_persist: self.safe_to_persist,
            post_call: self.post_call.clone(),
            lease: Lease::View,
        }
    }

    /// Give up this lease. The last release of a cache entry removes it and
    /// runs its release hook; the hook's error is returned here.
    pub async fn release(self) -> CacheResult<()> {
        match self.lease {
            Lease::Cached { cache, result } => cache.release_result(result).await,
            Lease::Detached { on_release } => match on_release {
                Some(f) => f().await,
                None => Ok(()),
            },
            Lease::View => Ok(()),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lease = match &self.lease {
            Lease::Cached { result, .. } => format!("cached#{}", result),
            Lease::Detached { .. } => "detached".to_string(),
            Lease::View => "view".to_string(),
        };
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("value", &self.value)
            .field("hit_cache", &self.hit_cache)
            .field("lease", &lease)
            .finish()
    }
}
