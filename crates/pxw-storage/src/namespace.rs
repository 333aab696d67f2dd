//! Namespace maintenance: clearing this runtime's keys and reporting usage.

use pxw_core::PxwResult;
use tracing::{debug, info};

use crate::traits::StringStorage;

/// Bytes used by a storage backend, split by namespace ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageUsage {
    /// Keys + values across the whole store
    pub total_bytes: u64,
    /// Keys + values under the runtime namespace
    pub namespace_bytes: u64,
    /// Number of keys under the namespace
    pub namespace_keys: usize,
}

/// Remove every key that starts with `namespace`. Returns how many were removed.
pub async fn clear_namespace(storage: &dyn StringStorage, namespace: &str) -> PxwResult<usize> {
    let doomed: Vec<String> = storage
        .keys()
        .await?
        .into_iter()
        .filter(|k| k.starts_with(namespace))
        .collect();

    for key in &doomed {
        storage.remove(key).await?;
        debug!(key = %key, "removed namespaced key");
    }

    info!(namespace, removed = doomed.len(), "namespace cleared");
    Ok(doomed.len())
}

/// Measure how much of the store this runtime occupies.
pub async fn usage(storage: &dyn StringStorage, namespace: &str) -> PxwResult<StorageUsage> {
    let mut report = StorageUsage::default();
    for key in storage.keys().await? {
        let size = match storage.get(&key).await? {
            Some(value) => (key.len() + value.len()) as u64,
            None => continue,
        };
        report.total_bytes += size;
        if key.starts_with(namespace) {
            report.namespace_bytes += size;
            report.namespace_keys += 1;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;

    #[tokio::test]
    async fn test_clear_only_touches_namespace() {
        let storage = MemoryStorage::new();
        storage.set("pixelwall:fhevm:public-keys", "{}").await.unwrap();
        storage.set("pixelwall:auth:abc", "{}").await.unwrap();
        storage.set("other-app:settings", "dark").await.unwrap();

        let removed = clear_namespace(&storage, "pixelwall:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.keys().await.unwrap(), vec!["other-app:settings".to_string()]);
    }

    #[tokio::test]
    async fn test_usage_report() {
        let storage = MemoryStorage::new();
        storage.set("pixelwall:a", "12345").await.unwrap();
        storage.set("x", "1").await.unwrap();

        let report = usage(&storage, "pixelwall:").await.unwrap();
        assert_eq!(report.namespace_keys, 1);
        assert_eq!(report.namespace_bytes, 11 + 5);
        assert_eq!(report.total_bytes, 11 + 5 + 2);
    }
}
