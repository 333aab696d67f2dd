//! Relayer SDK seam: how the production path obtains, initializes and uses
//! the external encryption SDK.

use std::sync::Arc;

use async_trait::async_trait;
use pxw_core::config::RelayerConfig;
use pxw_core::{PxwError, PxwResult};
use tracing::{info, warn};

use crate::instance::{EncryptionInstance, InstanceConfig, NetworkDefaults};

/// Options handed to the SDK's one-time initialization.
#[derive(Debug, Clone, Default)]
pub struct SdkInitOptions {
    pub relayer_url: Option<String>,
    pub api_key: Option<String>,
}

/// A loaded relayer SDK.
#[async_trait]
pub trait RelayerSdk: Send + Sync {
    /// One-time initialization. `Ok(false)` means the SDK refused to start.
    async fn init(&self, options: &SdkInitOptions) -> PxwResult<bool>;

    /// Network defaults baked into the SDK (contract addresses and so on).
    fn default_config(&self) -> NetworkDefaults;

    async fn create_instance(&self, config: InstanceConfig) -> PxwResult<Arc<dyn EncryptionInstance>>;
}

/// Fetches an SDK bundle from a URL.
#[async_trait]
pub trait SdkLoader: Send + Sync {
    async fn load(&self, url: &str) -> PxwResult<Arc<dyn RelayerSdk>>;
}

/// Where the production path gets its SDK from.
#[derive(Clone)]
pub enum SdkSource {
    /// Already present in the process
    Available(Arc<dyn RelayerSdk>),
    /// Must be loaded: primary location first, then the fallback copy
    Loadable {
        loader: Arc<dyn SdkLoader>,
        primary_url: String,
        fallback_url: String,
    },
    /// No SDK configured; the production path fails with `SdkLoad`
    Unavailable,
}

impl SdkSource {
    /// Bundle locations come from the relayer config. Without a loader the
    /// SDK can only be one that an earlier session already stored.
    pub fn from_config(relayer: &RelayerConfig, loader: Option<Arc<dyn SdkLoader>>) -> Self {
        match loader {
            Some(loader) => SdkSource::Loadable {
                loader,
                primary_url: relayer.sdk_primary_url.clone(),
                fallback_url: relayer.sdk_fallback_url.clone(),
            },
            None => SdkSource::Unavailable,
        }
    }
}

/// Load from `primary_url`, falling back to `fallback_url`.
pub async fn load_with_fallback(
    loader: &dyn SdkLoader,
    primary_url: &str,
    fallback_url: &str,
) -> PxwResult<Arc<dyn RelayerSdk>> {
    match loader.load(primary_url).await {
        Ok(sdk) => {
            info!(url = %primary_url, "relayer SDK loaded");
            return Ok(sdk);
        }
        Err(e) => warn!(url = %primary_url, "primary SDK load failed, trying fallback: {e}"),
    }

    match loader.load(fallback_url).await {
        Ok(sdk) => {
            info!(url = %fallback_url, "relayer SDK loaded from fallback");
            Ok(sdk)
        }
        Err(e) => {
            warn!(url = %fallback_url, "fallback SDK load failed: {e}");
            Err(PxwError::SdkLoad {
                primary: primary_url.to_string(),
                fallback: fallback_url.to_string(),
            })
        }
    }
}
