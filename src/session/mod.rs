//! Session-scoped view of a shared cache

pub mod cache;
pub mod telemetry;

pub use cache::SessionCache;
pub use telemetry::{Telemetry, TracingTelemetry};
