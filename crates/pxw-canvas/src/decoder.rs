//! Batch decryption of ciphertext handles under one authorization.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use pxw_core::{Address, Handle, HandleRef, PxwResult};
use pxw_fhe::{AuthorizationManager, EncryptionInstance, Signer};
use tracing::debug;

/// Everything needed to turn handles owned by `contract` into plaintexts.
#[derive(Clone)]
pub struct Decoder {
    pub instance: Arc<dyn EncryptionInstance>,
    pub auth: Arc<AuthorizationManager>,
    pub signer: Arc<dyn Signer>,
    pub contract: Address,
}

impl Decoder {
    pub fn new(
        instance: Arc<dyn EncryptionInstance>,
        auth: Arc<AuthorizationManager>,
        signer: Arc<dyn Signer>,
        contract: Address,
    ) -> Self {
        Self {
            instance,
            auth,
            signer,
            contract,
        }
    }

    pub fn user(&self) -> Address {
        self.signer.address()
    }

    /// Decrypt the distinct non-zero handles in `handles` in a single call.
    ///
    /// Zero handles are skipped and absent from the result. An empty set
    /// returns immediately without asking for an authorization.
    pub async fn decode<I>(&self, handles: I, force_new: bool) -> PxwResult<HashMap<Handle, u64>>
    where
        I: IntoIterator<Item = Handle>,
    {
        let unique: BTreeSet<Handle> = handles.into_iter().filter(|h| !h.is_zero()).collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let auth = self
            .auth
            .ensure(self.instance.as_ref(), self.signer.as_ref(), &[self.contract], force_new)
            .await?;

        let refs: Vec<HandleRef> = unique
            .into_iter()
            .map(|handle| HandleRef {
                handle,
                contract: self.contract,
            })
            .collect();
        debug!(count = refs.len(), contract = %self.contract, "batch decrypt");
        self.instance.user_decrypt(&refs, &auth).await
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("chain_id", &self.instance.chain_id())
            .field("user", &self.signer.address())
            .field("contract", &self.contract)
            .finish()
    }
}
