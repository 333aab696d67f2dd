//! Encrypted input construction.

use pxw_core::{Address, EncryptedInput, PxwError, PxwResult};
use tracing::debug;

use crate::instance::EncryptionInstance;

/// Encrypt `value` as a 32-bit input from `user` to `contract`.
///
/// Values above `u32::MAX` are rejected with `InvalidValue` before anything
/// is encrypted.
pub async fn build_encrypted_input(
    instance: &dyn EncryptionInstance,
    contract: &Address,
    user: &Address,
    value: u64,
) -> PxwResult<EncryptedInput> {
    let narrow = u32::try_from(value).map_err(|_| PxwError::InvalidValue(value))?;
    let input = instance.encrypt_u32(contract, user, narrow).await?;
    debug!(contract = %contract, user = %user, handle = ?input.handle, "encrypted input built");
    Ok(input)
}
