//! Typed decryption request that the user signs.

use pxw_core::Address;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Primary type name of every decryption request.
pub const PRIMARY_TYPE: &str = "UserDecryptRequestVerification";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedDataDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

/// Request body: the public half of the decryption keypair and the exact
/// contract scope and validity window being granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    pub public_key: String,
    pub contract_addresses: Vec<Address>,
    pub start_timestamp: u64,
    pub duration_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedData {
    pub domain: TypedDataDomain,
    pub primary_type: String,
    pub message: DecryptRequest,
}

impl TypedData {
    pub fn new(domain: TypedDataDomain, message: DecryptRequest) -> Self {
        Self {
            domain,
            primary_type: PRIMARY_TYPE.to_string(),
            message,
        }
    }

    /// 32-byte digest that signers sign. Every field is length-prefixed so
    /// adjacent fields cannot be shifted into one another.
    pub fn digest(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"pxw-typed-data-v1");
        put_str(&mut h, &self.domain.name);
        put_str(&mut h, &self.domain.version);
        h.update(self.domain.chain_id.to_be_bytes());
        h.update(self.domain.verifying_contract.as_bytes());
        put_str(&mut h, &self.primary_type);
        put_str(&mut h, &self.message.public_key);
        h.update((self.message.contract_addresses.len() as u64).to_be_bytes());
        for contract in &self.message.contract_addresses {
            h.update(contract.as_bytes());
        }
        h.update(self.message.start_timestamp.to_be_bytes());
        h.update(self.message.duration_days.to_be_bytes());
        h.finalize().into()
    }
}

fn put_str(h: &mut Sha256, s: &str) {
    h.update((s.len() as u64).to_be_bytes());
    h.update(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TypedData {
        TypedData::new(
            TypedDataDomain {
                name: "Decryption".into(),
                version: "1".into(),
                chain_id: 31337,
                verifying_contract: Address::ZERO,
            },
            DecryptRequest {
                public_key: "0xabcd".into(),
                contract_addresses: vec![Address::from_bytes([1u8; 20])],
                start_timestamp: 1_700_000_000,
                duration_days: 365,
            },
        )
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(sample().digest(), sample().digest());
    }

    #[test]
    fn test_digest_binds_scope_and_window() {
        let base = sample();

        let mut wider = sample();
        wider.message.contract_addresses.push(Address::from_bytes([2u8; 20]));
        assert_ne!(base.digest(), wider.digest());

        let mut longer = sample();
        longer.message.duration_days = 366;
        assert_ne!(base.digest(), longer.digest());

        let mut other_chain = sample();
        other_chain.domain.chain_id = 1;
        assert_ne!(base.digest(), other_chain.digest());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["primaryType"], PRIMARY_TYPE);
        assert_eq!(json["domain"]["chainId"], 31337);
        assert_eq!(json["message"]["durationDays"], 365);
    }
}
