//! JSON-RPC access to the ledger node, and simulation detection.
//!
//! A chain is treated as simulated only when all three hold:
//! - its chain id is registered as a mock chain
//! - `web3_clientVersion` reports a Hardhat node
//! - `fhevm_relayer_metadata` returns ACL, input verifier and KMS verifier
//!   addresses (each `0x`-prefixed)
//!
//! Failing the version call is fatal (`RpcUnreachable`). A node that is
//! Hardhat but returns no usable metadata falls through to the production
//! path with a warning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pxw_core::{Address, PxwError, PxwResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Minimal JSON-RPC surface the runtime needs from a node.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Endpoint this client talks to, when it has one.
    fn url(&self) -> Option<String>;

    async fn chain_id(&self) -> PxwResult<u64>;

    /// `web3_clientVersion`. Errors map to `PxwError::RpcUnreachable`.
    async fn client_version(&self) -> PxwResult<String>;

    /// `fhevm_relayer_metadata`. Errors map to `PxwError::SimulationMetadata`.
    async fn relayer_metadata(&self) -> PxwResult<Value>;
}

/// Opens RPC clients for URLs.
pub trait RpcConnector: Send + Sync {
    fn connect(&self, url: &str) -> PxwResult<Arc<dyn RpcClient>>;
}

/// Network designator: an RPC URL or an already-connected client.
#[derive(Clone)]
pub enum Network {
    Url(String),
    Provider(Arc<dyn RpcClient>),
}

impl Network {
    pub fn url(&self) -> Option<String> {
        match self {
            Network::Url(u) => Some(u.clone()),
            Network::Provider(p) => p.url(),
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Url(u) => f.debug_tuple("Url").field(u).finish(),
            Network::Provider(p) => f
                .debug_tuple("Provider")
                .field(&p.url().unwrap_or_else(|| "<in-process>".into()))
                .finish(),
        }
    }
}

/// Contract addresses reported by a simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationMetadata {
    #[serde(rename = "ACLAddress")]
    pub acl_address: Address,
    #[serde(rename = "InputVerifierAddress")]
    pub input_verifier_address: Address,
    #[serde(rename = "KMSVerifierAddress")]
    pub kms_verifier_address: Address,
}

impl SimulationMetadata {
    /// Validate a raw metadata object. Each address must be a `0x` string.
    pub fn from_value(url: &str, value: &Value) -> PxwResult<Self> {
        let field = |name: &str| -> PxwResult<Address> {
            let raw = value
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| s.starts_with("0x"))
                .ok_or_else(|| PxwError::SimulationMetadata {
                    url: url.to_string(),
                    reason: format!("missing or malformed {name}"),
                })?;
            raw.parse()
        };
        Ok(Self {
            acl_address: field("ACLAddress")?,
            input_verifier_address: field("InputVerifierAddress")?,
            kms_verifier_address: field("KMSVerifierAddress")?,
        })
    }
}

/// Query the node for simulation metadata.
///
/// `Ok(None)`: not a Hardhat node. `Err(SimulationMetadata)`: Hardhat, but
/// the metadata call failed or returned something unusable.
pub async fn fetch_simulation_metadata(client: &dyn RpcClient) -> PxwResult<Option<SimulationMetadata>> {
    let url = client.url().unwrap_or_default();
    let version = client.client_version().await?;
    if !version.to_lowercase().contains("hardhat") {
        debug!(url = %url, version = %version, "node is not a simulation node");
        return Ok(None);
    }

    let raw = client.relayer_metadata().await?;
    SimulationMetadata::from_value(&url, &raw).map(Some)
}

/// Like [`fetch_simulation_metadata`], but a metadata failure is logged and
/// reported as "not simulated". Only an unreachable node is an error.
pub async fn probe_simulation(client: &dyn RpcClient) -> PxwResult<Option<SimulationMetadata>> {
    match fetch_simulation_metadata(client).await {
        Ok(found) => Ok(found),
        Err(e @ PxwError::SimulationMetadata { .. }) | Err(e @ PxwError::InvalidAddress(_)) => {
            warn!("simulation metadata unavailable, using production path: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ── HTTP transport ──────────────────────────────────────────────────────────

enum CallError {
    Transport(String),
    Rpc(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Transport(m) => write!(f, "transport: {m}"),
            CallError::Rpc(m) => write!(f, "rpc: {m}"),
        }
    }
}

/// JSON-RPC 2.0 over HTTP.
pub struct HttpRpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: &str, timeout: Duration) -> PxwResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PxwError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str) -> Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": [] });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CallError::Transport(format!("HTTP {status}")));
        }
        let mut payload: Value = response
            .json()
            .await
            .map_err(|e| CallError::Transport(format!("decoding response: {e}")))?;

        if let Some(err) = payload.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(CallError::Rpc(message));
        }
        debug!(method, id, "rpc call ok");
        Ok(payload.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    fn unreachable(&self, e: CallError) -> PxwError {
        PxwError::RpcUnreachable {
            url: self.url.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    fn url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    async fn chain_id(&self) -> PxwResult<u64> {
        let result = self.call("eth_chainId").await.map_err(|e| self.unreachable(e))?;
        let raw = result.as_str().unwrap_or_default();
        parse_quantity(raw).ok_or_else(|| PxwError::RpcUnreachable {
            url: self.url.clone(),
            reason: format!("malformed eth_chainId result: {result}"),
        })
    }

    async fn client_version(&self) -> PxwResult<String> {
        let result = self
            .call("web3_clientVersion")
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    async fn relayer_metadata(&self) -> PxwResult<Value> {
        self.call("fhevm_relayer_metadata")
            .await
            .map_err(|e| PxwError::SimulationMetadata {
                url: self.url.clone(),
                reason: e.to_string(),
            })
    }
}

/// Connector producing [`HttpRpcClient`]s.
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RpcConnector for HttpConnector {
    fn connect(&self, url: &str) -> PxwResult<Arc<dyn RpcClient>> {
        Ok(Arc::new(HttpRpcClient::new(url, self.timeout)?))
    }
}

/// Parse a JSON-RPC quantity (`0x`-prefixed hex, or plain decimal).
fn parse_quantity(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeNode {
        version: PxwResult<String>,
        metadata: Value,
    }

    fn metadata() -> Value {
        json!({
            "ACLAddress": "0x50157CFfD6bBFA2DECe204a89ec419c23ef5755D",
            "InputVerifierAddress": "0x901F8942346f7AB3a01F6D7613119Bca447Bb030",
            "KMSVerifierAddress": "0x1364cBBf2cDF5032C47d8226a6f6FBD2AFCDacAC",
        })
    }

    #[async_trait]
    impl RpcClient for FakeNode {
        fn url(&self) -> Option<String> {
            Some("http://fake".into())
        }
        async fn chain_id(&self) -> PxwResult<u64> {
            Ok(31337)
        }
        async fn client_version(&self) -> PxwResult<String> {
            match &self.version {
                Ok(v) => Ok(v.clone()),
                Err(_) => Err(PxwError::RpcUnreachable {
                    url: "http://fake".into(),
                    reason: "connection refused".into(),
                }),
            }
        }
        async fn relayer_metadata(&self) -> PxwResult<Value> {
            Ok(self.metadata.clone())
        }
    }

    #[tokio::test]
    async fn test_hardhat_with_metadata_is_simulated() {
        let node = FakeNode {
            version: Ok("HardhatNetwork/2.22.0/@nomicfoundation/edr".into()),
            metadata: metadata(),
        };
        let meta = probe_simulation(&node).await.unwrap().unwrap();
        assert_eq!(
            meta.acl_address,
            "0x50157CFfD6bBFA2DECe204a89ec419c23ef5755D".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_non_hardhat_is_production() {
        let node = FakeNode {
            version: Ok("anvil/v0.2.0".into()),
            metadata: metadata(),
        };
        assert!(probe_simulation(&node).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_metadata_falls_through() {
        let mut bad = metadata();
        bad["KMSVerifierAddress"] = json!("1364cBBf2cDF5032C47d8226a6f6FBD2AFCDacAC");
        let node = FakeNode {
            version: Ok("hardhat".into()),
            metadata: bad,
        };

        let strict = fetch_simulation_metadata(&node).await.unwrap_err();
        assert_eq!(strict.code(), "FHEVM_RELAYER_METADATA_ERROR");
        assert!(probe_simulation(&node).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_version_is_fatal() {
        let node = FakeNode {
            version: Err(PxwError::NotReady),
            metadata: metadata(),
        };
        let err = probe_simulation(&node).await.unwrap_err();
        assert_eq!(err.code(), "WEB3_CLIENTVERSION_ERROR");
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x7a69"), Some(31337));
        assert_eq!(parse_quantity("11155111"), Some(11155111));
        assert_eq!(parse_quantity("0xzz"), None);
    }
}
