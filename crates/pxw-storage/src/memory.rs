//! In-memory storage backend

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use pxw_core::{PxwError, PxwResult};

use crate::traits::StringStorage;

/// In-memory string storage with an optional byte capacity.
///
/// Thread-safe via `RwLock`. Not persistent: data is lost on drop.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
    max_bytes: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory storage that rejects writes once `max_bytes` (key + value
    /// lengths) would be exceeded.
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_bytes: Some(max_bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes stored (keys + values)
    pub fn total_size(&self) -> u64 {
        self.read()
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StringStorage for MemoryStorage {
    async fn get(&self, key: &str) -> PxwResult<Option<String>> {
        Ok(self.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> PxwResult<()> {
        let mut map = self.write();
        if let Some(max) = self.max_bytes {
            let current: u64 = map
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            if current + (key.len() + value.len()) as u64 > max {
                return Err(PxwError::QuotaExceeded { key: key.to_string() });
            }
        }
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> PxwResult<()> {
        self.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> PxwResult<Vec<String>> {
        Ok(self.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let storage = MemoryStorage::new();
        storage.set("a", "1").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(storage.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_idempotent() {
        let storage = MemoryStorage::new();
        storage.remove("missing").await.unwrap();
        storage.set("k", "v").await.unwrap();
        storage.remove("k").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_exceeded_keeps_old_value() {
        let storage = MemoryStorage::with_capacity(10);
        storage.set("k", "small").await.unwrap();

        let err = storage.set("k", "much too large").await.unwrap_err();
        assert!(matches!(err, PxwError::QuotaExceeded { .. }));
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("small"));
    }

    #[tokio::test]
    async fn test_overwrite_does_not_double_count() {
        let storage = MemoryStorage::with_capacity(8);
        storage.set("key", "abcd").await.unwrap();
        // Same key replaced: 3 + 5 = 8 fits
        storage.set("key", "abcde").await.unwrap();
        assert_eq!(storage.total_size(), 8);
    }
}
