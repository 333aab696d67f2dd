use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::PxwError;

/// A 20-byte ledger account or contract address, rendered as `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Address of a public key: the trailing 20 bytes of its digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0u8; 20];
        let start = digest.len().saturating_sub(20);
        let tail = &digest[start..];
        bytes[20 - tail.len()..].copy_from_slice(tail);
        Self(bytes)
    }
}

impl FromStr for Address {
    type Err = PxwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = strip_hex_prefix(s).ok_or_else(|| PxwError::InvalidAddress(s.to_string()))?;
        if body.len() != 40 {
            return Err(PxwError::InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(body, &mut bytes)
            .map_err(|_| PxwError::InvalidAddress(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Opaque 32-byte reference to a ciphertext held by the coprocessor.
///
/// The all-zero handle is the sentinel for "no value written".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle([u8; 32]);

impl Handle {
    pub const ZERO: Handle = Handle([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl FromStr for Handle {
    type Err = PxwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PxwError::Decrypt(format!("malformed ciphertext handle: {s}"));
        let body = strip_hex_prefix(s).ok_or_else(invalid)?;
        if body.len() != 64 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(body, &mut bytes).map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "Handle(0x{}…)", &hex[..12])
    }
}

fn strip_hex_prefix(s: &str) -> Option<&str> {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
}

macro_rules! serde_via_string {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_string!(Address);
serde_via_string!(Handle);

/// A handle together with the contract whose ACL governs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    pub handle: Handle,
    pub contract: Address,
}

/// Ciphertext handle plus the validity proof binding it to (contract, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedInput {
    pub handle: Handle,
    pub proof: Vec<u8>,
}

/// Position of an event in the ledger's total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LogPosition {
    pub block: u64,
    pub index: u32,
}

impl LogPosition {
    pub fn new(block: u64, index: u32) -> Self {
        Self { block, index }
    }
}

/// One painted coordinate of the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
    pub handle: Handle,
    pub painter: Address,
    /// Unix seconds of the block that carried the write
    pub updated_at: u64,
    /// `#RRGGBB`, present only after a successful decode
    pub color: Option<String>,
    /// Ledger position of the write this cell reflects
    pub position: LogPosition,
}

/// Grid metadata as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanvasMeta {
    pub width: u32,
    pub height: u32,
    pub is_locked: bool,
    pub locked_at: u64,
    pub created_at: u64,
    pub minted_token_id: Option<u64>,
}

impl CanvasMeta {
    /// Lock time when locked, otherwise creation time.
    pub fn last_updated_at(&self) -> u64 {
        if self.locked_at > 0 {
            self.locked_at
        } else {
            self.created_at
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }
}
