//! Per-call telemetry hooks

use crate::call::CallId;
use crate::error::CacheError;
use tracing::{debug, info_span};

/// Observer notified around session cache calls.
///
/// `begin` and `done` are always paired for a call that is emitted.
pub trait Telemetry: Send + Sync {
    fn begin(&self, id: &CallId);

    /// `cached` is true when the call was served from the cache
    fn done(&self, id: &CallId, cached: bool, error: Option<&CacheError>);
}

/// Telemetry that writes call outcomes to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn begin(&self, id: &CallId) {
        let span = info_span!("call", path = %id.path());
        let _enter = span.enter();
        debug!("Call started");
    }

    fn done(&self, id: &CallId, cached: bool, error: Option<&CacheError>) {
        match error {
            Some(e) => debug!("Call {} failed: {}", id.path(), e),
            None if cached => debug!("Call {} served from cache", id.path()),
            None => debug!("Call {} computed", id.path()),
        }
    }
}
