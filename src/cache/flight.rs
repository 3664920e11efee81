//! Single-flight bookkeeping shared by call and arbitrary entries

use crate::error::{CacheError, CacheResult};
use crate::scope::Cancellation;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;

pub(crate) type FlightId = u64;

/// One in-progress execution and the callers waiting on it
pub(crate) struct Flight {
    pub waiters: usize,
    /// Handed to the compute fn; fired when the last waiter leaves
    pub cancel: Cancellation,
    pub done: watch::Receiver<bool>,
    /// Set once the compute fn returns; `Ok` holds the materialized entry id
    pub outcome: Option<CacheResult<u64>>,
}

impl Flight {
    pub fn new() -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let flight = Self {
            waiters: 1,
            cancel: Cancellation::new(),
            done: rx,
            outcome: None,
        };
        (flight, tx)
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    /// The outcome as seen by a waiter that was not itself canceled
    pub fn observed(&self) -> CacheResult<u64> {
        self.outcome
            .clone()
            .unwrap_or_else(|| Err(CacheError::Internal("flight ended without an outcome".into())))
    }

    /// Record that one waiter left. Returns true if it was the last one, in
    /// which case the compute fn's cancellation fires with `cause`.
    pub fn leave(&mut self, cause: &str) -> bool {
        self.waiters = self.waiters.saturating_sub(1);
        if self.waiters == 0 {
            self.cancel.cancel(cause);
            return true;
        }
        false
    }
}

/// How a waiter stopped waiting
pub(crate) enum Woke {
    /// The flight completed; `already` when it was done before we waited
    Done { already: bool },
    /// The waiter's own cancellation fired first
    Canceled(CacheError),
}

pub(crate) async fn wait(mut done: watch::Receiver<bool>, cancel: &Cancellation) -> Woke {
    if *done.borrow() {
        return Woke::Done { already: true };
    }
    loop {
        tokio::select! {
            biased;
            changed = done.changed() => {
                // a dropped sender also means the flight task is finished
                if changed.is_err() || *done.borrow() {
                    return Woke::Done { already: false };
                }
            }
            _ = cancel.canceled() => {
                return Woke::Canceled(CacheError::canceled(cancel.cause()));
            }
        }
    }
}

/// Cause reported to a compute fn when its last waiter leaves
pub(crate) fn leave_cause<T>(outcome: &CacheResult<T>) -> String {
    match outcome {
        Ok(_) => "call completed".to_string(),
        Err(CacheError::Canceled { cause }) => cause.clone(),
        Err(e) => e.to_string(),
    }
}

/// Await a compute future, turning a panic into an error
pub(crate) async fn run_guarded<T, Fut>(fut: Fut) -> CacheResult<T>
where
    Fut: Future<Output = CacheResult<T>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(CacheError::Internal("compute function panicked".into())))
}
