//! OpenDAL-backed durable storage

use async_trait::async_trait;
use opendal::Operator;
use pxw_core::{PxwError, PxwResult};
use std::path::Path;
use tokio::sync::Mutex;

use crate::traits::StringStorage;

/// Build an OpenDAL Operator for the given root directory, or an in-memory
/// operator when no directory is configured.
pub fn build_operator(root: Option<&Path>) -> PxwResult<Operator> {
    let op = match root {
        Some(dir) => {
            let builder = opendal::services::Fs::default().root(&dir.to_string_lossy());
            Operator::new(builder)
                .map_err(|e| PxwError::Storage(format!("creating fs operator at {}: {e}", dir.display())))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        None => Operator::new(opendal::services::Memory::default())
            .map_err(|e| PxwError::Storage(format!("creating memory operator: {e}")))?
            .finish(),
    };
    Ok(op)
}

/// String storage on top of an OpenDAL operator: one object per key.
///
/// Writes go through a single mutex so the capacity check and the write are
/// atomic with respect to other writers in this process.
pub struct OperatorStorage {
    op: Operator,
    max_bytes: Option<u64>,
    write_lock: Mutex<()>,
}

impl OperatorStorage {
    pub fn new(op: Operator, max_bytes: Option<u64>) -> Self {
        Self {
            op,
            max_bytes,
            write_lock: Mutex::new(()),
        }
    }

    /// Open (or create) a store under `dir` with the given capacity.
    pub fn open(dir: &Path, max_bytes: u64) -> PxwResult<Self> {
        Ok(Self::new(build_operator(Some(dir))?, Some(max_bytes)))
    }

    async fn stored_bytes_excluding(&self, key: &str) -> PxwResult<u64> {
        let mut total = 0u64;
        for k in self.keys().await? {
            if k == key {
                continue;
            }
            let meta = self
                .op
                .stat(&k)
                .await
                .map_err(|e| PxwError::Storage(format!("stat {k}: {e}")))?;
            total += meta.content_length() + k.len() as u64;
        }
        Ok(total)
    }
}

#[async_trait]
impl StringStorage for OperatorStorage {
    async fn get(&self, key: &str) -> PxwResult<Option<String>> {
        match self.op.read(key).await {
            Ok(buf) => {
                let s = String::from_utf8(buf.to_bytes().to_vec())
                    .map_err(|_| PxwError::Storage(format!("value for {key} is not UTF-8")))?;
                Ok(Some(s))
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PxwError::Storage(format!("reading {key}: {e}"))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> PxwResult<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(max) = self.max_bytes {
            let current = self.stored_bytes_excluding(key).await?;
            if current + (key.len() + value.len()) as u64 > max {
                return Err(PxwError::QuotaExceeded { key: key.to_string() });
            }
        }
        self.op
            .write(key, value.as_bytes().to_vec())
            .await
            .map_err(|e| PxwError::Storage(format!("writing {key}: {e}")))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> PxwResult<()> {
        let _guard = self.write_lock.lock().await;
        self.op
            .delete(key)
            .await
            .map_err(|e| PxwError::Storage(format!("deleting {key}: {e}")))
    }

    async fn keys(&self) -> PxwResult<Vec<String>> {
        let entries = match self.op.list("/").await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PxwError::Storage(format!("listing keys: {e}"))),
        };
        Ok(entries
            .into_iter()
            .filter(|e| e.metadata().mode().is_file())
            .map(|e| e.path().trim_start_matches('/').to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_operator_roundtrip() {
        let storage = OperatorStorage::new(build_operator(None).unwrap(), None);
        storage.set("pixelwall:k", "v").await.unwrap();
        assert_eq!(storage.get("pixelwall:k").await.unwrap().as_deref(), Some("v"));
        assert!(storage.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = OperatorStorage::open(dir.path(), 1024).unwrap();
            storage.set("pixelwall:fhevm", "payload").await.unwrap();
        }
        let reopened = OperatorStorage::open(dir.path(), 1024).unwrap();
        assert_eq!(
            reopened.get("pixelwall:fhevm").await.unwrap().as_deref(),
            Some("payload")
        );
        assert_eq!(reopened.keys().await.unwrap(), vec!["pixelwall:fhevm".to_string()]);
    }

    #[tokio::test]
    async fn test_fs_store_enforces_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = OperatorStorage::open(dir.path(), 32).unwrap();
        storage.set("a", "0123456789").await.unwrap();

        let err = storage.set("b", &"x".repeat(40)).await.unwrap_err();
        assert!(matches!(err, PxwError::QuotaExceeded { .. }));
        assert!(storage.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let storage = OperatorStorage::open(dir.path(), 1024).unwrap();
        storage.remove("nothing-here").await.unwrap();
    }
}
