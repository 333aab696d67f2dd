//! In-process coprocessor for simulated chains.
//!
//! Ciphertexts are real XChaCha20-Poly1305 blobs keyed from a per-process
//! seed; the ledger only ever sees 32-byte handles.
//!
//! Stored ciphertext format:
//! ```text
//! [24 bytes: random nonce][4 bytes: encrypted u32 (BE)][16 bytes: Poly1305 tag]
//! AAD = contract address (20 bytes)
//! ```
//!
//! Input proofs are BLAKE3 keyed MACs over `handle || contract || user`, so a
//! ciphertext submitted by one user to one contract cannot be replayed by
//! another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use pxw_core::{Address, EncryptedInput, Handle, HandleRef, PxwError, PxwResult};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroize;

use crate::auth::DecryptionAuthorization;
use crate::instance::{DecryptionKeypair, EncryptionInstance};
use crate::rpc::SimulationMetadata;
use crate::signer::verify_typed_signature;
use crate::typed_data::{DecryptRequest, TypedData, TypedDataDomain};
use crate::{unix_now, SECONDS_PER_DAY};

const NONCE_SIZE: usize = 24;
const KEY_SIZE: usize = 32;

struct StoredCiphertext {
    contract: Address,
    blob: Vec<u8>,
}

/// Simulated encrypted-computation backend.
pub struct MockCoprocessor {
    cipher_key: [u8; KEY_SIZE],
    proof_key: [u8; KEY_SIZE],
    public_key: Vec<u8>,
    ciphertexts: RwLock<HashMap<Handle, StoredCiphertext>>,
    counter: AtomicU64,
}

impl MockCoprocessor {
    /// Fresh backend with a random seed.
    pub fn new() -> PxwResult<Self> {
        let mut seed = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut seed);
        let backend = Self::from_seed(&seed);
        seed.zeroize();
        backend
    }

    /// Deterministic keys from `seed`.
    pub fn from_seed(seed: &[u8; KEY_SIZE]) -> PxwResult<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, seed);
        let mut cipher_key = [0u8; KEY_SIZE];
        let mut proof_key = [0u8; KEY_SIZE];
        let mut public_key = vec![0u8; 64];
        for (info, out) in [
            (&b"pxw-mock-cipher"[..], &mut cipher_key[..]),
            (&b"pxw-mock-proof"[..], &mut proof_key[..]),
            (&b"pxw-mock-public-key"[..], &mut public_key[..]),
        ] {
            hkdf.expand(info, out)
                .map_err(|e| PxwError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
        }
        Ok(Self {
            cipher_key,
            proof_key,
            public_key,
            ciphertexts: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
        })
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    /// Public parameters for the given bit size.
    pub fn public_params(&self, bits: u32) -> Vec<u8> {
        let mut out = blake3::Hasher::new();
        out.update(b"pxw-mock-public-params");
        out.update(&bits.to_be_bytes());
        out.update(&self.public_key);
        out.finalize().as_bytes().to_vec()
    }

    /// Number of ciphertexts held.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encrypt `value` as an input from `user` to `contract`, with proof.
    pub fn encrypt(&self, value: u32, contract: &Address, user: &Address) -> PxwResult<EncryptedInput> {
        let handle = self.trivial_encrypt(value, contract)?;
        let proof = self.input_mac(&handle, contract, user).as_bytes().to_vec();
        Ok(EncryptedInput { handle, proof })
    }

    /// Encrypt `value` for `contract` without an input proof (ledger-side
    /// constants and computation results).
    pub fn trivial_encrypt(&self, value: u32, contract: &Address) -> PxwResult<Handle> {
        let cipher = XChaCha20Poly1305::new((&self.cipher_key).into());
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &value.to_be_bytes(),
                    aad: contract.as_bytes(),
                },
            )
            .map_err(|e| PxwError::Other(anyhow::anyhow!("mock encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut h = blake3::Hasher::new();
        h.update(b"pxw-handle");
        h.update(&seq.to_be_bytes());
        h.update(&blob);
        let handle = Handle::from_bytes(*h.finalize().as_bytes());

        self.write().insert(
            handle,
            StoredCiphertext {
                contract: *contract,
                blob,
            },
        );
        Ok(handle)
    }

    /// Check that `input` was produced by [`encrypt`](Self::encrypt) for this
    /// (contract, user) pair.
    pub fn verify_input(&self, input: &EncryptedInput, contract: &Address, user: &Address) -> bool {
        let Ok(proof) = <[u8; 32]>::try_from(input.proof.as_slice()) else {
            return false;
        };
        // blake3::Hash equality is constant-time
        blake3::Hash::from(proof) == self.input_mac(&input.handle, contract, user)
            && self.read().contains_key(&input.handle)
    }

    /// Homomorphic `handle + delta` (wrapping). The zero handle counts as 0.
    pub fn add_scalar(&self, handle: &Handle, delta: u32, contract: &Address) -> PxwResult<Handle> {
        let current = if handle.is_zero() {
            0
        } else {
            self.decrypt(handle, contract)?
        };
        self.trivial_encrypt(current.wrapping_add(delta), contract)
    }

    /// Re-bind a ciphertext held under one contract to another (an ACL grant
    /// followed by a copy).
    pub fn rebind(&self, handle: &Handle, from: &Address, to: &Address) -> PxwResult<Handle> {
        let value = self.decrypt(handle, from)?;
        self.trivial_encrypt(value, to)
    }

    pub(crate) fn decrypt(&self, handle: &Handle, contract: &Address) -> PxwResult<u32> {
        let map = self.read();
        let stored = map
            .get(handle)
            .ok_or_else(|| PxwError::Decrypt(format!("unknown handle {handle}")))?;
        if stored.contract != *contract {
            return Err(PxwError::Decrypt(format!(
                "handle {handle} is not readable by contract {contract}"
            )));
        }
        if stored.blob.len() < NONCE_SIZE {
            return Err(PxwError::Decrypt(format!("truncated ciphertext for {handle}")));
        }
        let (nonce, ciphertext) = stored.blob.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&self.cipher_key).into());
        let plain = cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: contract.as_bytes(),
                },
            )
            .map_err(|_| PxwError::Decrypt(format!("ciphertext for {handle} failed authentication")))?;
        let bytes: [u8; 4] = plain
            .as_slice()
            .try_into()
            .map_err(|_| PxwError::Decrypt(format!("ciphertext for {handle} has wrong width")))?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn input_mac(&self, handle: &Handle, contract: &Address, user: &Address) -> blake3::Hash {
        let mut h = blake3::Hasher::new_keyed(&self.proof_key);
        h.update(handle.as_bytes());
        h.update(contract.as_bytes());
        h.update(user.as_bytes());
        h.finalize()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Handle, StoredCiphertext>> {
        self.ciphertexts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Handle, StoredCiphertext>> {
        self.ciphertexts.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for MockCoprocessor {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.proof_key.zeroize();
    }
}

impl std::fmt::Debug for MockCoprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCoprocessor")
            .field("ciphertexts", &self.len())
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

/// Encryption instance bound to a simulated chain.
pub struct MockInstance {
    chain_id: u64,
    metadata: SimulationMetadata,
    coprocessor: Arc<MockCoprocessor>,
}

impl MockInstance {
    pub fn new(chain_id: u64, metadata: SimulationMetadata, coprocessor: Arc<MockCoprocessor>) -> Self {
        Self {
            chain_id,
            metadata,
            coprocessor,
        }
    }

    pub fn metadata(&self) -> &SimulationMetadata {
        &self.metadata
    }

    fn check_authorization(&self, auth: &DecryptionAuthorization) -> PxwResult<()> {
        if !DecryptionKeypair::is_consistent(&auth.public_key, auth.private_key()) {
            return Err(PxwError::Decrypt("decryption keypair mismatch".into()));
        }

        let expected = self.create_typed_data(
            &auth.public_key,
            &auth.contract_addresses,
            auth.start_timestamp,
            auth.duration_days,
        );
        verify_typed_signature(&expected, &auth.signature, &auth.user_address)?;

        let expires_at = auth.start_timestamp + u64::from(auth.duration_days) * SECONDS_PER_DAY;
        if unix_now() >= expires_at {
            return Err(PxwError::Decrypt("decryption authorization expired".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EncryptionInstance for MockInstance {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        Some(self.coprocessor.public_key())
    }

    fn public_params(&self, bits: u32) -> Option<Vec<u8>> {
        Some(self.coprocessor.public_params(bits))
    }

    async fn encrypt_u32(&self, contract: &Address, user: &Address, value: u32) -> PxwResult<EncryptedInput> {
        self.coprocessor.encrypt(value, contract, user)
    }

    fn generate_keypair(&self) -> DecryptionKeypair {
        DecryptionKeypair::generate()
    }

    fn create_typed_data(
        &self,
        public_key: &str,
        contracts: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> TypedData {
        TypedData::new(
            TypedDataDomain {
                name: "Decryption".into(),
                version: "1".into(),
                chain_id: self.chain_id,
                verifying_contract: self.metadata.kms_verifier_address,
            },
            DecryptRequest {
                public_key: public_key.to_string(),
                contract_addresses: contracts.to_vec(),
                start_timestamp,
                duration_days,
            },
        )
    }

    async fn user_decrypt(
        &self,
        handles: &[HandleRef],
        auth: &DecryptionAuthorization,
    ) -> PxwResult<HashMap<Handle, u64>> {
        self.check_authorization(auth)?;

        let mut out = HashMap::with_capacity(handles.len());
        for r in handles {
            if !auth.contract_addresses.contains(&r.contract) {
                return Err(PxwError::Decrypt(format!(
                    "contract {} is outside the authorized scope",
                    r.contract
                )));
            }
            let value = self.coprocessor.decrypt(&r.handle, &r.contract)?;
            out.insert(r.handle, u64::from(value));
        }
        debug!(count = out.len(), user = %auth.user_address, "mock user decrypt");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cp = MockCoprocessor::new().unwrap();
        let input = cp.encrypt(0xFF0000, &addr(1), &addr(2)).unwrap();
        assert!(!input.handle.is_zero());
        assert_eq!(cp.decrypt(&input.handle, &addr(1)).unwrap(), 0xFF0000);
    }

    #[test]
    fn test_handle_bound_to_contract() {
        let cp = MockCoprocessor::new().unwrap();
        let h = cp.trivial_encrypt(5, &addr(1)).unwrap();
        assert!(cp.decrypt(&h, &addr(9)).is_err());
    }

    #[test]
    fn test_input_proof_binds_user_and_contract() {
        let cp = MockCoprocessor::new().unwrap();
        let input = cp.encrypt(7, &addr(1), &addr(2)).unwrap();
        assert!(cp.verify_input(&input, &addr(1), &addr(2)));
        assert!(!cp.verify_input(&input, &addr(1), &addr(3)));
        assert!(!cp.verify_input(&input, &addr(4), &addr(2)));

        let mut forged = input.clone();
        forged.proof[0] ^= 1;
        assert!(!cp.verify_input(&forged, &addr(1), &addr(2)));
    }

    #[test]
    fn test_add_scalar_from_zero_handle() {
        let cp = MockCoprocessor::new().unwrap();
        let one = cp.add_scalar(&Handle::ZERO, 1, &addr(1)).unwrap();
        let two = cp.add_scalar(&one, 1, &addr(1)).unwrap();
        assert_ne!(one, two);
        assert_eq!(cp.decrypt(&two, &addr(1)).unwrap(), 2);
    }

    #[test]
    fn test_seeded_backends_share_public_material() {
        let a = MockCoprocessor::from_seed(&[7u8; 32]).unwrap();
        let b = MockCoprocessor::from_seed(&[7u8; 32]).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.public_params(2048), b.public_params(2048));
        assert_ne!(a.public_params(2048), a.public_params(1024));
    }
}
