//! Per-call context threaded through every cache entry point
//!
//! A [`CallScope`] carries what would otherwise be ambient state: the
//! caller's cancellation, the set of calls already in progress on this
//! logical call stack (for recursion detection), the storage key of the
//! call currently executing, and the session id used to scope TTL entries.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_CAUSE: &str = "context canceled";

/// Cancellation token that remembers why it fired
#[derive(Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    cause: Arc<Mutex<Option<String>>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with a cause. Only the first cause is kept.
    pub fn cancel(&self, cause: impl Into<String>) {
        {
            let mut slot = self.cause.lock();
            if slot.is_none() {
                *slot = Some(cause.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cause recorded by the first `cancel`
    pub fn cause(&self) -> String {
        self.cause
            .lock()
            .clone()
            .unwrap_or_else(|| DEFAULT_CAUSE.to_string())
    }

    /// Resolves once canceled
    pub async fn canceled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl std::fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellation")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// One frame of the in-progress call stack. Frames are shared with every
/// scope derived below them, so deriving never copies the stack.
#[derive(Debug)]
struct InProgress {
    cache: Uuid,
    storage_key: String,
    parent: Option<Arc<InProgress>>,
}

impl InProgress {
    fn frames(start: Option<&Arc<InProgress>>) -> impl Iterator<Item = &InProgress> {
        std::iter::successors(start.map(Arc::as_ref), |frame| frame.parent.as_deref())
    }
}

/// Explicit call context
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    cancel: Cancellation,
    in_progress: Option<Arc<InProgress>>,
    storage_key: Option<String>,
    session_id: Option<String>,
    repeated_telemetry: bool,
}

impl CallScope {
    /// A scope that is never canceled and has no session
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Ask the session wrapper to emit telemetry even for keys it has seen
    pub fn with_repeated_telemetry(mut self) -> Self {
        self.repeated_telemetry = true;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Storage key of the call this scope is executing, if any
    pub fn storage_key(&self) -> Option<&str> {
        self.storage_key.as_deref()
    }

    pub fn repeated_telemetry(&self) -> bool {
        self.repeated_telemetry
    }

    pub(crate) fn without_repeated_telemetry(mut self) -> Self {
        self.repeated_telemetry = false;
        self
    }

    pub(crate) fn with_storage_key(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = Some(storage_key.into());
        self
    }

    pub(crate) fn is_in_progress(&self, cache: Uuid, storage_key: &str) -> bool {
        InProgress::frames(self.in_progress.as_ref())
            .any(|frame| frame.cache == cache && frame.storage_key == storage_key)
    }

    /// Derived scope for a compute fn: marks `storage_key` as in progress and
    /// swaps in the flight's own cancellation.
    pub(crate) fn for_execution(&self, cache: Uuid, storage_key: &str, cancel: Cancellation) -> Self {
        let frame = InProgress {
            cache,
            storage_key: storage_key.to_string(),
            parent: self.in_progress.clone(),
        };
        Self {
            cancel,
            in_progress: Some(Arc::new(frame)),
            storage_key: Some(storage_key.to_string()),
            session_id: self.session_id.clone(),
            repeated_telemetry: self.repeated_telemetry,
        }
    }
}
