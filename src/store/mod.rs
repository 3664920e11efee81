//! Persisted TTL bookkeeping
//!
//! The cache only persists expiration metadata: for each call key, the
//! storage key its TTL-scoped result lives under and when that expires.

mod file;
mod memory;

pub use file::FileExpirationStore;
pub use memory::MemoryExpirationStore;

use crate::error::CacheResult;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Expiration metadata for one call key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationRecord {
    pub call_key: String,
    pub storage_key: String,
    /// Unix seconds
    pub expiration: i64,
}

impl ExpirationRecord {
    pub fn new(call_key: impl Into<String>, storage_key: impl Into<String>, expiration: i64) -> Self {
        Self {
            call_key: call_key.into(),
            storage_key: storage_key.into(),
            expiration,
        }
    }

    /// Check if the record has lapsed at `now` (unix seconds)
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration < now
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expiration, 0).single()
    }
}

/// Backing store for TTL metadata
#[async_trait]
pub trait ExpirationStore: Send + Sync {
    /// Current record for a call key, if any
    async fn select_expiration(&self, call_key: &str) -> CacheResult<Option<ExpirationRecord>>;

    /// Record a new storage key and expiration for `call_key`.
    ///
    /// Only applies when the current record's storage key equals
    /// `prev_storage_key` (an empty `prev_storage_key` matches a missing
    /// record). Returns whether the record was written.
    async fn set_expiration(
        &self,
        call_key: &str,
        storage_key: &str,
        expiration: i64,
        prev_storage_key: &str,
    ) -> CacheResult<bool>;

    /// Delete every record that expired before `now`; returns how many
    async fn gc_expired(&self, now: i64) -> CacheResult<usize>;

    /// All records, ordered by call key
    async fn list(&self) -> CacheResult<Vec<ExpirationRecord>>;
}

/// Compare-and-set applied by every store implementation
pub(crate) fn may_replace(current: Option<&ExpirationRecord>, prev_storage_key: &str) -> bool {
    match current {
        None => true,
        Some(record) => record.storage_key == prev_storage_key,
    }
}
