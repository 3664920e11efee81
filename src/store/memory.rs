//! In-process expiration store

use crate::error::CacheResult;
use crate::store::{may_replace, ExpirationRecord, ExpirationStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Expiration store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryExpirationStore {
    records: Mutex<BTreeMap<String, ExpirationRecord>>,
}

impl MemoryExpirationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpirationStore for MemoryExpirationStore {
    async fn select_expiration(&self, call_key: &str) -> CacheResult<Option<ExpirationRecord>> {
        Ok(self.records.lock().get(call_key).cloned())
    }

    async fn set_expiration(
        &self,
        call_key: &str,
        storage_key: &str,
        expiration: i64,
        prev_storage_key: &str,
    ) -> CacheResult<bool> {
        let mut records = self.records.lock();
        if !may_replace(records.get(call_key), prev_storage_key) {
            return Ok(false);
        }
        records.insert(
            call_key.to_string(),
            ExpirationRecord::new(call_key, storage_key, expiration),
        );
        Ok(true)
    }

    async fn gc_expired(&self, now: i64) -> CacheResult<usize> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok(before - records.len())
    }

    async fn list(&self) -> CacheResult<Vec<ExpirationRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
