//! Public key / public params cache
//!
//! The instance's public encryption key and public parameters are large and
//! slow to fetch, so after a successful production bootstrap they are kept
//! in the durable store under `{namespace}fhevm:public-keys`.
//!
//! Stored document (JSON):
//! ```text
//! { "version": 2,
//!   "entries": { "<acl address>": { "publicKey": b64, "publicParams": b64 } } }
//! ```
//!
//! Every `set` rewrites the whole document with exactly one entry, so the
//! cache never grows past the most recent ACL domain. Documents written by
//! older layouts (or anything that does not decode) read back as empty.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use pxw_core::{Address, PxwError, PxwResult};
use pxw_storage::{clear_namespace, SharedStorage};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Key suffix appended to the runtime namespace.
pub const PUBLIC_KEYS_SUFFIX: &str = "fhevm:public-keys";

const DOCUMENT_VERSION: u32 = 2;

/// Cached public material for one ACL domain.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKeyEntry {
    pub domain: Address,
    pub public_key: Vec<u8>,
    pub public_params: Vec<u8>,
}

impl std::fmt::Debug for PublicKeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKeyEntry")
            .field("domain", &self.domain)
            .field("public_key_len", &self.public_key.len())
            .field("public_params_len", &self.public_params.len())
            .finish()
    }
}

/// Outcome of a cache write. Writes never fail the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    /// Written on the first attempt
    Stored,
    /// Store was full; namespace cleared and the retry succeeded
    StoredAfterClear,
    /// Write abandoned (logged)
    Skipped,
}

#[derive(Serialize, Deserialize)]
struct Document {
    version: u32,
    entries: BTreeMap<Address, StoredEntry>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "publicParams")]
    public_params: String,
}

/// Single-entry public parameter cache over a shared string store.
#[derive(Clone)]
pub struct ParameterCache {
    storage: SharedStorage,
    namespace: String,
}

impl ParameterCache {
    pub fn new(storage: SharedStorage, namespace: impl Into<String>) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
        }
    }

    /// Storage key holding the document.
    pub fn key(&self) -> String {
        format!("{}{}", self.namespace, PUBLIC_KEYS_SUFFIX)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Cached material for `domain`, if present and decodable.
    pub async fn get(&self, domain: &Address) -> PxwResult<Option<PublicKeyEntry>> {
        let entry = self
            .entries()
            .await?
            .into_iter()
            .find(|e| e.domain == *domain);
        debug!(domain = %domain, hit = entry.is_some(), "parameter cache lookup");
        Ok(entry)
    }

    /// Every decodable entry in the stored document (at most one when the
    /// document was written by this cache).
    pub async fn entries(&self) -> PxwResult<Vec<PublicKeyEntry>> {
        let key = self.key();
        let Some(raw) = self.storage.get(&key).await? else {
            return Ok(Vec::new());
        };

        let doc: Document = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                debug!(key = %key, "discarding undecodable parameter cache document: {e}");
                return Ok(Vec::new());
            }
        };
        if doc.version != DOCUMENT_VERSION {
            debug!(key = %key, version = doc.version, "discarding parameter cache from another layout");
            return Ok(Vec::new());
        }

        Ok(doc
            .entries
            .into_iter()
            .filter_map(|(domain, stored)| decode_entry(domain, &stored))
            .collect())
    }

    /// Replace the cache with exactly one entry for `domain`.
    ///
    /// A full store is recovered by clearing the runtime namespace and
    /// retrying once. Any remaining failure is logged and the bootstrap
    /// proceeds without a cache.
    pub async fn set(&self, domain: &Address, public_key: &[u8], public_params: &[u8]) -> CacheWrite {
        let key = self.key();
        let payload = match encode_document(domain, public_key, public_params) {
            Ok(p) => p,
            Err(e) => {
                error!(domain = %domain, "encoding parameter cache failed: {e}");
                return CacheWrite::Skipped;
            }
        };

        match self.storage.set(&key, &payload).await {
            Ok(()) => {
                debug!(domain = %domain, bytes = payload.len(), "parameter cache stored");
                CacheWrite::Stored
            }
            Err(PxwError::QuotaExceeded { .. }) => {
                warn!(
                    domain = %domain,
                    namespace = %self.namespace,
                    "storage quota exceeded, clearing namespace and retrying"
                );
                if let Err(e) = clear_namespace(self.storage.as_ref(), &self.namespace).await {
                    error!("clearing namespace after quota failure: {e}");
                    return CacheWrite::Skipped;
                }
                match self.storage.set(&key, &payload).await {
                    Ok(()) => CacheWrite::StoredAfterClear,
                    Err(e) => {
                        error!(domain = %domain, "parameter cache retry failed, continuing without cache: {e}");
                        CacheWrite::Skipped
                    }
                }
            }
            Err(e) => {
                error!(domain = %domain, "unexpected parameter cache write failure: {e}");
                CacheWrite::Skipped
            }
        }
    }

    /// Drop the cached document.
    pub async fn clear(&self) -> PxwResult<()> {
        self.storage.remove(&self.key()).await
    }
}

fn encode_document(domain: &Address, public_key: &[u8], public_params: &[u8]) -> PxwResult<String> {
    let mut entries = BTreeMap::new();
    entries.insert(
        *domain,
        StoredEntry {
            public_key: B64.encode(public_key),
            public_params: B64.encode(public_params),
        },
    );
    let doc = Document {
        version: DOCUMENT_VERSION,
        entries,
    };
    serde_json::to_string(&doc).map_err(|e| PxwError::Storage(format!("encoding public keys: {e}")))
}

fn decode_entry(domain: Address, stored: &StoredEntry) -> Option<PublicKeyEntry> {
    let public_key = B64.decode(&stored.public_key).ok()?;
    let public_params = B64.decode(&stored.public_params).ok()?;
    Some(PublicKeyEntry {
        domain,
        public_key,
        public_params,
    })
}
