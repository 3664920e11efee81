//! dagcache - result cache for DAG-based computation engines
//!
//! Concurrent identical calls share one execution, equivalent call
//! identities share results through an equivalence graph, and TTL-scoped
//! results are tracked in a persisted expiration store.

pub mod cache;
pub mod call;
pub mod cli;
pub mod config;
pub mod error;
pub mod scope;
pub mod session;
pub mod store;
pub mod value;

pub use cache::{Cache, CacheEntryStats, CacheKey, Handle, ValueBundle};
pub use call::CallId;
pub use error::{CacheError, CacheResult};
pub use scope::CallScope;
pub use session::SessionCache;
