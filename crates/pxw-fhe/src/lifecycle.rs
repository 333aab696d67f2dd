//! Encryption instance lifecycle.
//!
//! ```text
//! idle → resolving ─┬─► mock-path ─────────────────────────────────────► creating → ready
//!                   └─► production-path → sdk-loading → sdk-loaded
//!                         → sdk-initializing → sdk-initialized → creating → ready
//! any state → error | aborted
//! ```
//!
//! Only one bootstrap runs at a time: starting a new one cancels the
//! previous one. A cancelled bootstrap returns `PxwError::Aborted`, changes
//! no state except its status, and never writes the parameter cache.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pxw_core::config::PxwConfig;
use pxw_core::{Address, PxwError, PxwResult};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::FheContext;
use crate::instance::{EncryptionInstance, InstanceConfig};
use crate::mock::MockInstance;
use crate::rpc::{probe_simulation, Network, RpcClient, RpcConnector, SimulationMetadata};
use crate::sdk::{load_with_fallback, RelayerSdk, SdkInitOptions, SdkSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Idle,
    Resolving,
    MockPath,
    ProductionPath,
    SdkLoading,
    SdkLoaded,
    SdkInitializing,
    SdkInitialized,
    Creating,
    Ready,
    Error,
    Aborted,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Idle => "idle",
            InstanceStatus::Resolving => "resolving",
            InstanceStatus::MockPath => "mock-path",
            InstanceStatus::ProductionPath => "production-path",
            InstanceStatus::SdkLoading => "sdk-loading",
            InstanceStatus::SdkLoaded => "sdk-loaded",
            InstanceStatus::SdkInitializing => "sdk-initializing",
            InstanceStatus::SdkInitialized => "sdk-initialized",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Error => "error",
            InstanceStatus::Aborted => "aborted",
        }
    }

    /// Whether a bootstrap is still in progress in this state.
    pub fn is_busy(&self) -> bool {
        !matches!(
            self,
            InstanceStatus::Idle | InstanceStatus::Ready | InstanceStatus::Error | InstanceStatus::Aborted
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs for the bootstrap, normally derived from config.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Simulated chain id → RPC URL of its node
    pub mock_chains: BTreeMap<u64, String>,
    pub sdk_init: SdkInitOptions,
    /// Configured bundle locations, reported when no SDK can be obtained
    pub sdk_primary_url: String,
    pub sdk_fallback_url: String,
    pub public_params_bits: u32,
}

impl ManagerOptions {
    pub fn from_config(config: &PxwConfig) -> Self {
        Self {
            mock_chains: config.network.mock_chain_urls(),
            sdk_init: SdkInitOptions {
                relayer_url: config.relayer.relayer_url.clone(),
                api_key: config.relayer.api_key.clone(),
            },
            sdk_primary_url: config.relayer.sdk_primary_url.clone(),
            sdk_fallback_url: config.relayer.sdk_fallback_url.clone(),
            public_params_bits: config.relayer.public_params_bits,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&PxwConfig::default())
    }
}

struct Bootstrap {
    id: u64,
    cancel: CancellationToken,
}

struct Ready {
    chain_id: u64,
    instance: Arc<dyn EncryptionInstance>,
}

/// Creates, replaces and tears down the encryption instance.
pub struct InstanceManager {
    ctx: Arc<FheContext>,
    sdk: SdkSource,
    connector: Arc<dyn RpcConnector>,
    options: ManagerOptions,
    status: watch::Sender<InstanceStatus>,
    current: RwLock<Option<Ready>>,
    in_flight: Mutex<Option<Bootstrap>>,
    next_id: AtomicU64,
}

impl InstanceManager {
    pub fn new(
        ctx: Arc<FheContext>,
        sdk: SdkSource,
        connector: Arc<dyn RpcConnector>,
        options: ManagerOptions,
    ) -> Self {
        let (status, _) = watch::channel(InstanceStatus::Idle);
        Self {
            ctx,
            sdk,
            connector,
            options,
            status,
            current: RwLock::new(None),
            in_flight: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<FheContext> {
        &self.ctx
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.borrow()
    }

    /// Receive every status transition.
    pub fn subscribe(&self) -> watch::Receiver<InstanceStatus> {
        self.status.subscribe()
    }

    /// The ready instance, if one exists.
    pub async fn current(&self) -> Option<Arc<dyn EncryptionInstance>> {
        self.current.read().await.as_ref().map(|r| r.instance.clone())
    }

    /// The ready instance, only if it is bound to `chain_id`.
    pub async fn current_for(&self, chain_id: u64) -> Option<Arc<dyn EncryptionInstance>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|r| r.chain_id == chain_id)
            .map(|r| r.instance.clone())
    }

    /// Return the instance for `network`'s chain, creating one if the chain
    /// differs from the current instance's (or there is none).
    pub async fn ensure(&self, network: &Network) -> PxwResult<Arc<dyn EncryptionInstance>> {
        let client = self.client_for(network)?;
        let chain_id = client.chain_id().await?;
        if let Some(instance) = self.current_for(chain_id).await {
            return Ok(instance);
        }
        self.start(network.clone()).await
    }

    /// Bootstrap a new instance, cancelling any bootstrap already running.
    pub async fn start(&self, network: Network) -> PxwResult<Arc<dyn EncryptionInstance>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self.lock_in_flight().replace(Bootstrap {
            id,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            debug!(previous = previous.id, "cancelling previous instance bootstrap");
            previous.cancel.cancel();
        }

        let outcome = self.create(&network, &cancel).await;

        match &outcome {
            Ok((chain_id, instance)) => {
                if cancel.is_cancelled() {
                    self.finish(id, InstanceStatus::Aborted);
                    return Err(PxwError::Aborted);
                }
                *self.current.write().await = Some(Ready {
                    chain_id: *chain_id,
                    instance: instance.clone(),
                });
                info!(chain_id, "encryption instance ready");
                self.finish(id, InstanceStatus::Ready);
            }
            Err(e) if e.is_abort() => {
                debug!("instance bootstrap aborted");
                self.finish(id, InstanceStatus::Aborted);
            }
            Err(e) => {
                warn!(code = e.code(), "instance bootstrap failed: {e}");
                self.finish(id, InstanceStatus::Error);
            }
        }
        outcome.map(|(_, instance)| instance)
    }

    /// Cancel the running bootstrap, if any.
    pub fn abort(&self) {
        if let Some(b) = self.lock_in_flight().take() {
            b.cancel.cancel();
        }
    }

    /// Cancel any bootstrap and drop the current instance.
    pub async fn teardown(&self) {
        self.abort();
        *self.current.write().await = None;
        self.status.send_replace(InstanceStatus::Idle);
    }

    async fn create(
        &self,
        network: &Network,
        cancel: &CancellationToken,
    ) -> PxwResult<(u64, Arc<dyn EncryptionInstance>)> {
        self.set_status(cancel, InstanceStatus::Resolving);
        let client = self.client_for(network)?;
        let chain_id = guarded(cancel, client.chain_id()).await?;
        debug!(chain_id, network = ?network, "resolved chain id");

        if let Some(mock_url) = self.options.mock_chains.get(&chain_id) {
            self.set_status(cancel, InstanceStatus::MockPath);
            if let Some(meta) = self.detect_simulation(&client, mock_url, cancel).await? {
                self.set_status(cancel, InstanceStatus::Creating);
                info!(chain_id, acl = %meta.acl_address, "simulated chain detected, using in-process coprocessor");
                let instance: Arc<dyn EncryptionInstance> =
                    Arc::new(MockInstance::new(chain_id, meta, self.ctx.coprocessor().clone()));
                check(cancel)?;
                return Ok((chain_id, instance));
            }
        }

        check(cancel)?;
        self.set_status(cancel, InstanceStatus::ProductionPath);
        let sdk = self.acquire_sdk(cancel).await?;

        if !self.ctx.sdk_initialized() {
            self.set_status(cancel, InstanceStatus::SdkInitializing);
            let ok = guarded(cancel, sdk.init(&self.options.sdk_init)).await?;
            if !ok {
                return Err(PxwError::SdkInit("initialization returned false".into()));
            }
            self.ctx.mark_sdk_initialized();
            self.set_status(cancel, InstanceStatus::SdkInitialized);
        }

        let defaults = sdk.default_config();
        let acl: Address = defaults.acl_contract_address.parse()?;

        let cached = match guarded(cancel, self.ctx.param_cache().get(&acl)).await {
            Ok(found) => found,
            Err(PxwError::Aborted) => return Err(PxwError::Aborted),
            Err(e) => {
                warn!(acl = %acl, "parameter cache unreadable, creating without it: {e}");
                None
            }
        };

        self.set_status(cancel, InstanceStatus::Creating);
        let config = InstanceConfig {
            network: network.clone(),
            chain_id,
            acl,
            defaults,
            cached,
        };
        let instance = guarded(cancel, sdk.create_instance(config)).await?;

        check(cancel)?;
        let bits = self.options.public_params_bits;
        if let (Some(pk), Some(pp)) = (instance.public_key(), instance.public_params(bits)) {
            self.ctx.param_cache().set(&acl, &pk, &pp).await;
        }
        Ok((chain_id, instance))
    }

    /// Simulation metadata for a chain listed in `mock_chains`.
    ///
    /// The resolved client is asked first. Only a provider without a URL of
    /// its own falls back to the node configured for the chain; failures
    /// there mean "not simulated".
    async fn detect_simulation(
        &self,
        client: &Arc<dyn RpcClient>,
        mock_url: &str,
        cancel: &CancellationToken,
    ) -> PxwResult<Option<SimulationMetadata>> {
        if let Some(meta) = guarded(cancel, probe_simulation(client.as_ref())).await? {
            return Ok(Some(meta));
        }
        if client.url().is_some() {
            return Ok(None);
        }

        let node = match self.connector.connect(mock_url) {
            Ok(node) => node,
            Err(e) => {
                warn!(url = mock_url, "simulated chain node unavailable: {e}");
                return Ok(None);
            }
        };
        match guarded(cancel, probe_simulation(node.as_ref())).await {
            Ok(found) => Ok(found),
            Err(PxwError::Aborted) => Err(PxwError::Aborted),
            Err(e) => {
                warn!(url = mock_url, "simulated chain node unreachable: {e}");
                Ok(None)
            }
        }
    }

    async fn acquire_sdk(&self, cancel: &CancellationToken) -> PxwResult<Arc<dyn RelayerSdk>> {
        match &self.sdk {
            SdkSource::Available(sdk) => Ok(sdk.clone()),
            SdkSource::Loadable {
                loader,
                primary_url,
                fallback_url,
            } => {
                if let Some(sdk) = self.ctx.loaded_sdk() {
                    return Ok(sdk);
                }
                self.set_status(cancel, InstanceStatus::SdkLoading);
                let sdk = guarded(
                    cancel,
                    load_with_fallback(loader.as_ref(), primary_url, fallback_url),
                )
                .await?;
                self.ctx.store_sdk(sdk.clone());
                self.set_status(cancel, InstanceStatus::SdkLoaded);
                Ok(sdk)
            }
            SdkSource::Unavailable => self.ctx.loaded_sdk().ok_or_else(|| {
                warn!(primary = %self.options.sdk_primary_url, "no SDK loader available for the relayer bundle");
                PxwError::SdkLoad {
                    primary: self.options.sdk_primary_url.clone(),
                    fallback: self.options.sdk_fallback_url.clone(),
                }
            }),
        }
    }

    fn client_for(&self, network: &Network) -> PxwResult<Arc<dyn RpcClient>> {
        match network {
            Network::Url(url) => self.connector.connect(url),
            Network::Provider(p) => Ok(p.clone()),
        }
    }

    /// Status updates from a cancelled bootstrap are dropped so they cannot
    /// overwrite the status of the bootstrap that replaced it.
    fn set_status(&self, cancel: &CancellationToken, status: InstanceStatus) {
        if !cancel.is_cancelled() {
            debug!(status = %status, "instance status");
            self.status.send_replace(status);
        }
    }

    /// Publish the final status of bootstrap `id`. A bootstrap superseded by
    /// a newer one leaves the status alone; one aborted without replacement
    /// reports `aborted` unless a teardown already reset it.
    fn finish(&self, id: u64, status: InstanceStatus) {
        let mut in_flight = self.lock_in_flight();
        match in_flight.as_ref() {
            Some(b) if b.id == id => {
                *in_flight = None;
                self.status.send_replace(status);
            }
            Some(_) => {}
            None => {
                if self.status().is_busy() {
                    self.status.send_replace(status);
                }
            }
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Option<Bootstrap>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn check(cancel: &CancellationToken) -> PxwResult<()> {
    if cancel.is_cancelled() {
        Err(PxwError::Aborted)
    } else {
        Ok(())
    }
}

/// Run `fut`, returning `Aborted` if `cancel` fires first or fired while it
/// was running.
async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> PxwResult<T>
where
    F: Future<Output = PxwResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PxwError::Aborted),
        result = fut => {
            check(cancel)?;
            result
        }
    }
}
