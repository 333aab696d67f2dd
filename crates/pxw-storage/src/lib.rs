//! pxw-storage: generic key-value string storage
//!
//! Backs the parameter cache and (optionally) persisted decryption
//! authorizations. Every backend enforces an optional byte capacity and
//! reports `PxwError::QuotaExceeded` instead of silently truncating.

pub mod memory;
pub mod namespace;
pub mod operator;
pub mod traits;

pub use memory::MemoryStorage;
pub use namespace::{clear_namespace, usage, StorageUsage};
pub use operator::{build_operator, OperatorStorage};
pub use traits::{SharedStorage, StringStorage};
