//! User signer: the wallet-facing half of authorization.
//!
//! Signature encoding: `0x` + hex(verifying key (32 bytes) || signature (64 bytes)).
//! Carrying the verifying key lets a verifier recover the signer address the
//! same way the signer derived it.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use pxw_core::{Address, PxwError, PxwResult};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::typed_data::TypedData;

const ENCODED_LEN: usize = 32 + 64;

/// Anything that can sign a typed decryption request on the user's behalf.
///
/// Implementations backed by an interactive wallet return
/// `PxwError::Authorization(AuthError::SigningRejected)` when the user declines.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_typed_data(&self, data: &TypedData) -> PxwResult<String>;
}

/// In-process ed25519 signer.
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn random() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn address(&self) -> Address {
        address_of(&self.key.verifying_key())
    }

    async fn sign_typed_data(&self, data: &TypedData) -> PxwResult<String> {
        let sig = self.key.sign(&data.digest());
        let mut out = Vec::with_capacity(ENCODED_LEN);
        out.extend_from_slice(self.key.verifying_key().as_bytes());
        out.extend_from_slice(&sig.to_bytes());
        Ok(format!("0x{}", hex::encode(out)))
    }
}

/// Ledger address of an ed25519 verifying key.
pub fn address_of(vk: &VerifyingKey) -> Address {
    Address::from_digest(&Sha256::digest(vk.as_bytes()))
}

/// Check that `signature` is a valid signature over `data` by `expected`.
pub fn verify_typed_signature(data: &TypedData, signature: &str, expected: &Address) -> PxwResult<()> {
    let invalid = |why: &str| PxwError::Decrypt(format!("invalid authorization signature: {why}"));

    let body = signature.strip_prefix("0x").ok_or_else(|| invalid("missing 0x prefix"))?;
    let raw = hex::decode(body).map_err(|_| invalid("not hex"))?;
    if raw.len() != ENCODED_LEN {
        return Err(invalid("wrong length"));
    }

    let (vk_bytes, sig_bytes) = raw.split_at(32);
    let mut vk_arr = [0u8; 32];
    vk_arr.copy_from_slice(vk_bytes);
    let vk = VerifyingKey::from_bytes(&vk_arr).map_err(|_| invalid("bad verifying key"))?;
    if address_of(&vk) != *expected {
        return Err(invalid("signer does not match user"));
    }

    let mut sig_arr = [0u8; 64];
    sig_arr.copy_from_slice(sig_bytes);
    vk.verify(&data.digest(), &Signature::from_bytes(&sig_arr))
        .map_err(|_| invalid("verification failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed_data::{DecryptRequest, TypedDataDomain};

    fn request() -> TypedData {
        TypedData::new(
            TypedDataDomain {
                name: "Decryption".into(),
                version: "1".into(),
                chain_id: 31337,
                verifying_contract: Address::ZERO,
            },
            DecryptRequest {
                public_key: "0x01".into(),
                contract_addresses: vec![Address::from_bytes([9u8; 20])],
                start_timestamp: 10,
                duration_days: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_sign_and_verify() {
        let signer = LocalSigner::random();
        let data = request();
        let sig = signer.sign_typed_data(&data).await.unwrap();
        verify_typed_signature(&data, &sig, &signer.address()).unwrap();
    }

    #[tokio::test]
    async fn test_tampered_request_rejected() {
        let signer = LocalSigner::random();
        let data = request();
        let sig = signer.sign_typed_data(&data).await.unwrap();

        let mut widened = data.clone();
        widened.message.contract_addresses.push(Address::from_bytes([8u8; 20]));
        assert!(verify_typed_signature(&widened, &sig, &signer.address()).is_err());
    }

    #[tokio::test]
    async fn test_wrong_user_rejected() {
        let alice = LocalSigner::random();
        let bob = LocalSigner::random();
        let data = request();
        let sig = alice.sign_typed_data(&data).await.unwrap();
        assert!(verify_typed_signature(&data, &sig, &bob.address()).is_err());
    }

    #[test]
    fn test_seeded_signer_is_deterministic() {
        assert_eq!(
            LocalSigner::from_seed([3u8; 32]).address(),
            LocalSigner::from_seed([3u8; 32]).address()
        );
    }
}
