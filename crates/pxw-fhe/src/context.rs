//! Process-wide runtime context.
//!
//! Everything that must survive individual instance lifecycles lives here:
//! the durable store, the parameter cache, the loaded SDK with its
//! "initialized" flag, and the in-process simulation backend. Construct one
//! per process and share it via `Arc`; tests build their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use pxw_core::config::PxwConfig;
use pxw_core::PxwResult;
use pxw_storage::{MemoryStorage, OperatorStorage, SharedStorage};
use tracing::info;

use crate::mock::MockCoprocessor;
use crate::param_cache::ParameterCache;
use crate::sdk::RelayerSdk;

pub struct FheContext {
    storage: SharedStorage,
    params: ParameterCache,
    sdk: RwLock<Option<Arc<dyn RelayerSdk>>>,
    sdk_initialized: AtomicBool,
    coprocessor: Arc<MockCoprocessor>,
}

impl FheContext {
    pub fn new(storage: SharedStorage, namespace: &str, coprocessor: Arc<MockCoprocessor>) -> Self {
        Self {
            params: ParameterCache::new(storage.clone(), namespace),
            storage,
            sdk: RwLock::new(None),
            sdk_initialized: AtomicBool::new(false),
            coprocessor,
        }
    }

    /// Unbounded in-memory store with a fresh simulation backend.
    pub fn in_memory() -> PxwResult<Self> {
        Ok(Self::new(
            Arc::new(MemoryStorage::new()),
            "pixelwall:",
            Arc::new(MockCoprocessor::new()?),
        ))
    }

    /// Durable store from `[cache]`: a directory-backed store when `dir` is
    /// set, otherwise in-memory. Both enforce `max_bytes`.
    pub fn from_config(config: &PxwConfig) -> PxwResult<Self> {
        let storage: SharedStorage = match &config.cache.dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                info!(dir = %dir.display(), max_bytes = config.cache.max_bytes, "opening durable store");
                Arc::new(OperatorStorage::open(dir, config.cache.max_bytes)?)
            }
            None => Arc::new(MemoryStorage::with_capacity(config.cache.max_bytes)),
        };
        Ok(Self::new(
            storage,
            &config.cache.namespace,
            Arc::new(MockCoprocessor::new()?),
        ))
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn param_cache(&self) -> &ParameterCache {
        &self.params
    }

    pub fn namespace(&self) -> &str {
        self.params.namespace()
    }

    pub fn coprocessor(&self) -> &Arc<MockCoprocessor> {
        &self.coprocessor
    }

    /// SDK loaded earlier in this process, if any.
    pub fn loaded_sdk(&self) -> Option<Arc<dyn RelayerSdk>> {
        self.sdk.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn store_sdk(&self, sdk: Arc<dyn RelayerSdk>) {
        *self.sdk.write().unwrap_or_else(|e| e.into_inner()) = Some(sdk);
    }

    pub fn sdk_initialized(&self) -> bool {
        self.sdk_initialized.load(Ordering::Acquire)
    }

    pub fn mark_sdk_initialized(&self) {
        self.sdk_initialized.store(true, Ordering::Release);
    }
}
