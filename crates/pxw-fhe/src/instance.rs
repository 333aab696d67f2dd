//! Encryption instance: the bound handle to a chain's encrypted-computation
//! environment.

use std::collections::HashMap;

use async_trait::async_trait;
use pxw_core::{Address, EncryptedInput, Handle, HandleRef, PxwResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::auth::DecryptionAuthorization;
use crate::param_cache::PublicKeyEntry;
use crate::rpc::Network;
use crate::typed_data::TypedData;

/// Client-side keypair used for re-encryption of decrypted values.
pub struct DecryptionKeypair {
    pub public_key: String,
    pub private_key: SecretString,
}

impl DecryptionKeypair {
    /// Fresh keypair: 32 random private bytes, public half derived from them.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);
        let public_key = public_half(&private);
        let private_key = SecretString::from(format!("0x{}", hex::encode(private)));
        private.zeroize();
        Self {
            public_key,
            private_key,
        }
    }

    /// Whether `public_key` is the public half of `private_key`.
    pub fn is_consistent(public_key: &str, private_key: &SecretString) -> bool {
        let Some(body) = private_key.expose_secret().strip_prefix("0x") else {
            return false;
        };
        let Ok(mut private) = hex::decode(body) else {
            return false;
        };
        let ok = public_half(&private) == public_key;
        private.zeroize();
        ok
    }
}

impl std::fmt::Debug for DecryptionKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKeypair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

fn public_half(private: &[u8]) -> String {
    format!("0x{}", hex::encode(Sha256::digest(private)))
}

/// Contract addresses an SDK reports as the network's defaults.
///
/// Kept as raw strings: they come from an external bundle and are validated
/// by the lifecycle manager before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDefaults {
    pub chain_id: u64,
    pub acl_contract_address: String,
    pub kms_contract_address: String,
    pub input_verifier_contract_address: String,
    pub verifying_contract_address_decryption: String,
    pub gateway_chain_id: u64,
    pub relayer_url: Option<String>,
}

/// Everything the SDK needs to create an instance.
#[derive(Clone)]
pub struct InstanceConfig {
    pub network: Network,
    pub chain_id: u64,
    pub acl: Address,
    pub defaults: NetworkDefaults,
    /// Cached public material for `acl`, if any
    pub cached: Option<PublicKeyEntry>,
}

/// A ready encryption/decryption capability bound to one chain.
#[async_trait]
pub trait EncryptionInstance: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Public encryption key, if the instance exposes one.
    fn public_key(&self) -> Option<Vec<u8>>;

    /// Public parameters at the given bit size, if exposed.
    fn public_params(&self, bits: u32) -> Option<Vec<u8>>;

    /// Encrypt a 32-bit value for `contract`, proven to come from `user`.
    async fn encrypt_u32(&self, contract: &Address, user: &Address, value: u32) -> PxwResult<EncryptedInput>;

    fn generate_keypair(&self) -> DecryptionKeypair;

    /// Build the request the user signs to authorize decryption.
    fn create_typed_data(
        &self,
        public_key: &str,
        contracts: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> TypedData;

    /// Decrypt `handles` under `auth`. Returns the plaintext for every handle.
    async fn user_decrypt(
        &self,
        handles: &[HandleRef],
        auth: &DecryptionAuthorization,
    ) -> PxwResult<HashMap<Handle, u64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keypair_is_consistent() {
        let kp = DecryptionKeypair::generate();
        assert!(DecryptionKeypair::is_consistent(&kp.public_key, &kp.private_key));
    }

    #[test]
    fn test_mismatched_keypair_detected() {
        let a = DecryptionKeypair::generate();
        let b = DecryptionKeypair::generate();
        assert!(!DecryptionKeypair::is_consistent(&a.public_key, &b.private_key));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let kp = DecryptionKeypair::generate();
        let rendered = format!("{kp:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains(kp.private_key.expose_secret()));
    }
}
