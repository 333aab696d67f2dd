//! Storage trait definitions

use async_trait::async_trait;
use pxw_core::PxwResult;
use std::sync::Arc;

/// Durable or in-memory string key-value store.
///
/// Writes replace the whole value for a key; readers never observe a
/// partially written value.
#[async_trait]
pub trait StringStorage: Send + Sync {
    /// Returns `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> PxwResult<Option<String>>;

    /// Store `value` under `key`.
    ///
    /// Returns `PxwError::QuotaExceeded` when the write would push the store
    /// over its capacity; the previous value (if any) is left intact.
    async fn set(&self, key: &str, value: &str) -> PxwResult<()>;

    /// Remove `key`. Succeeds even if the key did not exist.
    async fn remove(&self, key: &str) -> PxwResult<()>;

    /// All keys currently stored.
    async fn keys(&self) -> PxwResult<Vec<String>>;
}

/// Process-wide handle to a storage backend.
pub type SharedStorage = Arc<dyn StringStorage>;
