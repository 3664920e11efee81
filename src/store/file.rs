//! JSON file expiration store

use crate::error::{CacheError, CacheResult};
use crate::store::{may_replace, ExpirationRecord, ExpirationStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    records: BTreeMap<String, ExpirationRecord>,
}

/// Expiration store persisted as a single JSON document.
///
/// Every write rewrites the document through a temp file and rename.
/// Access is serialized within the process.
pub struct FileExpirationStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileExpirationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> CacheResult<Document> {
        if !fs::try_exists(&self.path)
            .await
            .map_err(|e| CacheError::io(format!("checking {}", self.path.display()), e))?
        {
            return Ok(Document::default());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| CacheError::io(format!("reading {}", self.path.display()), e))?;
        if content.trim().is_empty() {
            return Ok(Document::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| CacheError::Store(format!("corrupt store {}: {}", self.path.display(), e)))
    }

    async fn write(&self, doc: &Document) -> CacheResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::io(format!("creating {}", parent.display()), e))?;
        }

        let content = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| CacheError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CacheError::io(format!("replacing {}", self.path.display()), e))?;
        Ok(())
    }
}

#[async_trait]
impl ExpirationStore for FileExpirationStore {
    async fn select_expiration(&self, call_key: &str) -> CacheResult<Option<ExpirationRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.records.remove(call_key))
    }

    async fn set_expiration(
        &self,
        call_key: &str,
        storage_key: &str,
        expiration: i64,
        prev_storage_key: &str,
    ) -> CacheResult<bool> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        if !may_replace(doc.records.get(call_key), prev_storage_key) {
            debug!("Skipping stale expiration update for {}", call_key);
            return Ok(false);
        }
        doc.records.insert(
            call_key.to_string(),
            ExpirationRecord::new(call_key, storage_key, expiration),
        );
        self.write(&doc).await?;
        Ok(true)
    }

    async fn gc_expired(&self, now: i64) -> CacheResult<usize> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        let before = doc.records.len();
        doc.records.retain(|_, r| !r.is_expired(now));
        let removed = before - doc.records.len();
        if removed > 0 {
            self.write(&doc).await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> CacheResult<Vec<ExpirationRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.records.into_values().collect())
    }
}
