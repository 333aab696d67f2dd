//! Property tests over the simulation backend and the parameter cache.
//!
//! Verifies:
//!   1. Round-trip: every u32 encrypted as an input decrypts back to itself
//!   2. Decode idempotence: decrypting the same handle set twice agrees
//!   3. Bounded cache: the parameter cache never holds more than one entry

use std::sync::Arc;

use proptest::prelude::*;
use pxw_core::{Address, HandleRef};
use pxw_fhe::{
    build_encrypted_input, AuthorizationManager, EncryptionInstance, LocalSigner, MockCoprocessor,
    MockInstance, ParameterCache, Signer, SimulationMetadata,
};
use pxw_storage::MemoryStorage;

const CONTRACT: Address = Address::ZERO;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn instance() -> MockInstance {
    MockInstance::new(
        31337,
        SimulationMetadata {
            acl_address: Address::from_bytes([1u8; 20]),
            input_verifier_address: Address::from_bytes([2u8; 20]),
            kms_verifier_address: Address::from_bytes([3u8; 20]),
        },
        Arc::new(MockCoprocessor::from_seed(&[5u8; 32]).unwrap()),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_encrypt_decrypt_roundtrip(value in any::<u32>()) {
        runtime().block_on(async {
            let inst = instance();
            let signer = LocalSigner::from_seed([11u8; 32]);
            let user = signer.address();

            let input = build_encrypted_input(&inst, &CONTRACT, &user, u64::from(value)).await.unwrap();
            let auth = AuthorizationManager::default()
                .ensure(&inst, &signer, &[CONTRACT], false)
                .await
                .unwrap();
            let out = inst
                .user_decrypt(&[HandleRef { handle: input.handle, contract: CONTRACT }], &auth)
                .await
                .unwrap();
            prop_assert_eq!(out[&input.handle], u64::from(value));
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_decode_is_idempotent(values in proptest::collection::vec(any::<u32>(), 1..16)) {
        runtime().block_on(async {
            let inst = instance();
            let signer = LocalSigner::from_seed([12u8; 32]);
            let user = signer.address();

            let mut refs = Vec::new();
            for v in &values {
                let input = inst.encrypt_u32(&CONTRACT, &user, *v).await.unwrap();
                refs.push(HandleRef { handle: input.handle, contract: CONTRACT });
            }
            let auth = AuthorizationManager::default()
                .ensure(&inst, &signer, &[CONTRACT], false)
                .await
                .unwrap();

            let first = inst.user_decrypt(&refs, &auth).await.unwrap();
            let second = inst.user_decrypt(&refs, &auth).await.unwrap();
            prop_assert_eq!(first, second);
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_parameter_cache_holds_at_most_one_entry(
        domains in proptest::collection::vec(0u8..6, 1..20),
    ) {
        runtime().block_on(async {
            let cache = ParameterCache::new(Arc::new(MemoryStorage::new()), "pixelwall:");
            for d in &domains {
                let domain = Address::from_bytes([*d; 20]);
                cache.set(&domain, &[*d; 4], &[*d; 2]).await;

                let entries = cache.entries().await.unwrap();
                prop_assert_eq!(entries.len(), 1);
                prop_assert_eq!(entries[0].domain, domain);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
