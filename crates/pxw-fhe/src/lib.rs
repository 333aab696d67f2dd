//! pxw-fhe: encrypted-state client runtime
//!
//! Bootstrap pipeline:
//! ```text
//! RpcClient (chain id) ──► simulated chain? ──yes──► MockInstance (in-process coprocessor)
//!                               │no
//!                               ▼
//!              SdkSource (available | load primary → fallback)
//!                               ▼
//!              init once per process ─► ACL address ─► ParameterCache.get
//!                               ▼
//!              RelayerSdk::create_instance ─► ParameterCache.set (best effort)
//! ```
//!
//! Decryption needs a `DecryptionAuthorization`: a fresh keypair plus the
//! user's signature over a typed request naming the exact contract scope,
//! cached per (user, scope) and derived at most once concurrently.

pub mod auth;
pub mod context;
pub mod input;
pub mod instance;
pub mod lifecycle;
pub mod mock;
pub mod param_cache;
pub mod rpc;
pub mod sdk;
pub mod signer;
pub mod typed_data;

pub use auth::{AuthorizationManager, Clock, DecryptionAuthorization, ScopeKey};
pub use context::FheContext;
pub use input::build_encrypted_input;
pub use instance::{DecryptionKeypair, EncryptionInstance, InstanceConfig, NetworkDefaults};
pub use lifecycle::{InstanceManager, InstanceStatus, ManagerOptions};
pub use mock::{MockCoprocessor, MockInstance};
pub use param_cache::{CacheWrite, ParameterCache, PublicKeyEntry};
pub use rpc::{
    fetch_simulation_metadata, probe_simulation, HttpConnector, HttpRpcClient, Network, RpcClient,
    RpcConnector, SimulationMetadata,
};
pub use sdk::{RelayerSdk, SdkInitOptions, SdkLoader, SdkSource};
pub use signer::{LocalSigner, Signer};
pub use typed_data::{DecryptRequest, TypedData, TypedDataDomain};

/// Seconds in one authorization validity day.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
