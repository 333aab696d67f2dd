use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::PxwError;
use crate::types::Address;

/// Chain id of the local development node that always counts as simulated.
pub const LOCAL_CHAIN_ID: u64 = 31337;

/// Default RPC URL of the local development node.
pub const LOCAL_RPC_URL: &str = "http://localhost:8545";

/// Top-level runtime configuration (loaded from pxw.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PxwConfig {
    pub network: NetworkConfig,
    pub relayer: RelayerConfig,
    pub cache: CacheConfig,
    pub authorization: AuthorizationConfig,
    pub canvas: CanvasConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint of the active network
    pub rpc_url: String,
    /// Extra simulated chains: chain id (as string) → RPC URL.
    /// The local chain 31337 is always treated as simulated.
    pub mock_chains: BTreeMap<String, String>,
    /// Per-request timeout for JSON-RPC calls
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    /// Primary distribution endpoint for the relayer SDK bundle
    pub sdk_primary_url: String,
    /// Local fallback copy of the SDK bundle
    pub sdk_fallback_url: String,
    /// Relayer service endpoint passed to SDK initialization
    pub relayer_url: Option<String>,
    /// Relayer API key (optional)
    pub api_key: Option<String>,
    /// Bit size requested when reading back public params
    pub public_params_bits: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Durable key-value store root (None = in-memory only)
    pub dir: Option<PathBuf>,
    /// Key prefix owned by this runtime; cleared on quota recovery
    pub namespace: String,
    /// Storage capacity in bytes
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Validity window of a decryption authorization, in days
    pub duration_days: u32,
    /// Persist authorizations (including the private key) to the durable store.
    /// Off unless the operator explicitly opts in.
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    /// Grid identifier tracked by the reconstructor
    pub canvas_id: u64,
    /// Decrypt cells automatically on refresh
    pub auto_decrypt: bool,
    /// Deployed PixelWall contract per chain id (as string)
    pub contracts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl NetworkConfig {
    /// Simulated chains: the local default plus configured overrides.
    pub fn mock_chain_urls(&self) -> BTreeMap<u64, String> {
        let mut chains = BTreeMap::new();
        chains.insert(LOCAL_CHAIN_ID, LOCAL_RPC_URL.to_string());
        for (id, url) in &self.mock_chains {
            match id.parse::<u64>() {
                Ok(id) => {
                    chains.insert(id, url.clone());
                }
                Err(_) => tracing::warn!(chain = %id, "ignoring non-numeric mock chain id"),
            }
        }
        chains
    }
}

impl CanvasConfig {
    /// Contract address deployed on `chain_id`, if any.
    pub fn contract_for(&self, chain_id: u64) -> Result<Option<Address>, PxwError> {
        self.contracts
            .get(&chain_id.to_string())
            .map(|s| s.parse())
            .transpose()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: LOCAL_RPC_URL.into(),
            mock_chains: BTreeMap::new(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            sdk_primary_url: "https://cdn.zama.ai/relayer-sdk-js/0.2.0/relayer-sdk-js.umd.cjs".into(),
            sdk_fallback_url: "/relayer-sdk-js.umd.cjs".into(),
            relayer_url: None,
            api_key: None,
            public_params_bits: 2048,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            namespace: "pixelwall:".into(),
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            duration_days: 365,
            persist: false,
        }
    }
}

impl Default for CanvasConfig {
    fn default() -> Self {
        let mut contracts = BTreeMap::new();
        contracts.insert(
            "31337".into(),
            "0x5FbDB2315678afecb367f032d93F642f64180aa3".into(),
        );
        contracts.insert(
            "11155111".into(),
            "0x66074FBB821893a4a27AaAC8C3Bb003708E83c81".into(),
        );
        Self {
            canvas_id: 1,
            auto_decrypt: true,
            contracts,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
