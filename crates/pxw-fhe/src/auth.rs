//! Decryption authorization: derivation, caching and single-flight.
//!
//! An authorization is valid for one user and one exact contract scope
//! (sorted, deduplicated). Concurrent requests for the same scope share a
//! single derivation, so the user is asked to sign at most once. Changing
//! the active chain or user drops every cached authorization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pxw_core::{Address, AuthError, PxwError};
use pxw_storage::SharedStorage;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::instance::EncryptionInstance;
use crate::signer::Signer;
use crate::typed_data::TypedData;
use crate::{unix_now, SECONDS_PER_DAY};

/// Default validity window.
pub const DEFAULT_DURATION_DAYS: u32 = 365;

/// Source of "now" in unix seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// A signed grant letting the holder of `private_key` decrypt handles owned
/// by `contract_addresses` on behalf of `user_address`.
#[derive(Debug)]
pub struct DecryptionAuthorization {
    pub public_key: String,
    private_key: SecretString,
    pub signature: String,
    pub user_address: Address,
    pub contract_addresses: Vec<Address>,
    pub start_timestamp: u64,
    pub duration_days: u32,
    pub typed_data: TypedData,
}

impl DecryptionAuthorization {
    pub fn private_key(&self) -> &SecretString {
        &self.private_key
    }

    /// Unix second at which the authorization stops being valid.
    pub fn expires_at(&self) -> u64 {
        self.start_timestamp + u64::from(self.duration_days) * SECONDS_PER_DAY
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at()
    }

    /// Whether this authorization covers every contract in `contracts`.
    pub fn covers(&self, contracts: &[Address]) -> bool {
        contracts.iter().all(|c| self.contract_addresses.contains(c))
    }
}

/// On-disk form, written only when persistence is opted into.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedAuthorization {
    public_key: String,
    private_key: String,
    signature: String,
    user_address: Address,
    contract_addresses: Vec<Address>,
    start_timestamp: u64,
    duration_days: u32,
    typed_data: TypedData,
}

impl PersistedAuthorization {
    fn from_live(auth: &DecryptionAuthorization) -> Self {
        Self {
            public_key: auth.public_key.clone(),
            private_key: auth.private_key.expose_secret().to_string(),
            signature: auth.signature.clone(),
            user_address: auth.user_address,
            contract_addresses: auth.contract_addresses.clone(),
            start_timestamp: auth.start_timestamp,
            duration_days: auth.duration_days,
            typed_data: auth.typed_data.clone(),
        }
    }

    fn into_live(self) -> DecryptionAuthorization {
        DecryptionAuthorization {
            public_key: self.public_key,
            private_key: SecretString::from(self.private_key),
            signature: self.signature,
            user_address: self.user_address,
            contract_addresses: self.contract_addresses,
            start_timestamp: self.start_timestamp,
            duration_days: self.duration_days,
            typed_data: self.typed_data,
        }
    }
}

/// Cache key: user plus normalized contract scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub user: Address,
    pub contracts: Vec<Address>,
}

impl ScopeKey {
    pub fn new(user: Address, contracts: &[Address]) -> Self {
        let mut contracts = contracts.to_vec();
        contracts.sort();
        contracts.dedup();
        Self { user, contracts }
    }

    fn storage_suffix(&self) -> String {
        let mut h = Sha256::new();
        for c in &self.contracts {
            h.update(c.as_bytes());
        }
        format!("auth:{}:{}", self.user, hex::encode(h.finalize()))
    }
}

type Derivation = OnceCell<Result<Arc<DecryptionAuthorization>, AuthError>>;

#[derive(Default)]
struct AuthState {
    /// (chain id, user) the cache belongs to
    context: Option<(u64, Option<Address>)>,
    cache: HashMap<ScopeKey, Arc<DecryptionAuthorization>>,
    in_flight: HashMap<ScopeKey, Arc<Derivation>>,
    /// Bumped on every invalidation; a derivation started under an older
    /// epoch is returned to its callers but never cached.
    epoch: u64,
}

/// Per-process authorization cache with single-flight derivation.
pub struct AuthorizationManager {
    duration_days: u32,
    clock: Clock,
    persistence: Option<(SharedStorage, String)>,
    state: Mutex<AuthState>,
}

impl Default for AuthorizationManager {
    fn default() -> Self {
        Self::new(DEFAULT_DURATION_DAYS)
    }
}

impl AuthorizationManager {
    pub fn new(duration_days: u32) -> Self {
        Self {
            duration_days,
            clock: Arc::new(unix_now),
            persistence: None,
            state: Mutex::new(AuthState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Persist authorizations (including private keys) under `namespace`.
    pub fn with_persistence(mut self, storage: SharedStorage, namespace: impl Into<String>) -> Self {
        self.persistence = Some((storage, namespace.into()));
        self
    }

    pub fn duration_days(&self) -> u32 {
        self.duration_days
    }

    /// Record the active (chain, user). A change drops all cached and
    /// in-flight authorizations.
    pub fn set_context(&self, chain_id: u64, user: Option<Address>) {
        let mut st = self.lock();
        let next = Some((chain_id, user));
        if st.context != next {
            if st.context.is_some() {
                info!(chain_id, user = ?user, "wallet context changed, dropping decryption authorizations");
            }
            st.context = next;
            Self::clear_locked(&mut st);
        }
    }

    /// Drop every cached and in-flight authorization.
    pub fn invalidate(&self) {
        Self::clear_locked(&mut self.lock());
    }

    /// Cached, still-valid authorization for this scope.
    pub fn cached(&self, user: &Address, contracts: &[Address]) -> Option<Arc<DecryptionAuthorization>> {
        let key = ScopeKey::new(*user, contracts);
        let now = (self.clock)();
        self.lock()
            .cache
            .get(&key)
            .filter(|a| a.is_valid_at(now))
            .cloned()
    }

    /// Return a valid authorization for `contracts`, deriving one if needed.
    ///
    /// With `force_new`, any cached or in-flight authorization for the scope
    /// is discarded and the user is asked to sign again.
    pub async fn ensure(
        &self,
        instance: &dyn EncryptionInstance,
        signer: &dyn Signer,
        contracts: &[Address],
        force_new: bool,
    ) -> Result<Arc<DecryptionAuthorization>, AuthError> {
        let key = ScopeKey::new(signer.address(), contracts);
        self.set_context(instance.chain_id(), Some(key.user));

        let (flight, epoch) = {
            let mut st = self.lock();
            if force_new {
                st.cache.remove(&key);
                st.in_flight.remove(&key);
            } else if let Some(auth) = st.cache.get(&key) {
                if auth.is_valid_at((self.clock)()) {
                    return Ok(auth.clone());
                }
                debug!(user = %key.user, "cached decryption authorization expired");
                st.cache.remove(&key);
            }
            let flight = st
                .in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();
            (flight, st.epoch)
        };

        let result = flight
            .get_or_init(|| self.derive(instance, signer, &key, force_new))
            .await
            .clone();

        let mut st = self.lock();
        let ours = st
            .in_flight
            .get(&key)
            .is_some_and(|f| Arc::ptr_eq(f, &flight));
        if ours {
            st.in_flight.remove(&key);
            if let Ok(auth) = &result {
                if st.epoch == epoch {
                    st.cache.insert(key, auth.clone());
                }
            }
        }
        result
    }

    /// [`ensure`](Self::ensure), abandoned with `AuthError::Aborted` as soon as
    /// `cancel` fires. An abandoned derivation caches nothing.
    pub async fn ensure_cancellable(
        &self,
        instance: &dyn EncryptionInstance,
        signer: &dyn Signer,
        contracts: &[Address],
        force_new: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<DecryptionAuthorization>, AuthError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Aborted),
            result = self.ensure(instance, signer, contracts, force_new) => result,
        }
    }

    async fn derive(
        &self,
        instance: &dyn EncryptionInstance,
        signer: &dyn Signer,
        key: &ScopeKey,
        force_new: bool,
    ) -> Result<Arc<DecryptionAuthorization>, AuthError> {
        if !force_new {
            if let Some(stored) = self.load_persisted(key).await {
                return Ok(Arc::new(stored));
            }
        }

        let keypair = instance.generate_keypair();
        let start = (self.clock)();
        let typed_data =
            instance.create_typed_data(&keypair.public_key, &key.contracts, start, self.duration_days);

        info!(
            user = %key.user,
            contracts = key.contracts.len(),
            days = self.duration_days,
            "requesting decryption authorization signature"
        );
        let signature = signer
            .sign_typed_data(&typed_data)
            .await
            .map_err(|e| match e {
                PxwError::Authorization(inner) => inner,
                PxwError::Aborted => AuthError::Aborted,
                other => AuthError::SigningRejected(other.to_string()),
            })?;

        let auth = DecryptionAuthorization {
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            signature,
            user_address: key.user,
            contract_addresses: key.contracts.clone(),
            start_timestamp: start,
            duration_days: self.duration_days,
            typed_data,
        };
        self.store_persisted(key, &auth).await;
        Ok(Arc::new(auth))
    }

    async fn load_persisted(&self, key: &ScopeKey) -> Option<DecryptionAuthorization> {
        let (storage, namespace) = self.persistence.as_ref()?;
        let storage_key = format!("{namespace}{}", key.storage_suffix());
        let raw = match storage.get(&storage_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %storage_key, "reading persisted authorization: {e}");
                return None;
            }
        };
        let persisted: PersistedAuthorization = serde_json::from_str(&raw)
            .map_err(|e| debug!(key = %storage_key, "discarding unreadable authorization: {e}"))
            .ok()?;
        let auth = persisted.into_live();
        let chain_matches = self
            .lock()
            .context
            .is_some_and(|(chain, _)| chain == auth.typed_data.domain.chain_id);
        if !chain_matches || auth.user_address != key.user || !auth.is_valid_at((self.clock)()) {
            return None;
        }
        debug!(user = %key.user, "restored persisted decryption authorization");
        Some(auth)
    }

    async fn store_persisted(&self, key: &ScopeKey, auth: &DecryptionAuthorization) {
        let Some((storage, namespace)) = self.persistence.as_ref() else {
            return;
        };
        let storage_key = format!("{namespace}{}", key.storage_suffix());
        let payload = match serde_json::to_string(&PersistedAuthorization::from_live(auth)) {
            Ok(p) => p,
            Err(e) => {
                warn!("encoding authorization for persistence: {e}");
                return;
            }
        };
        if let Err(e) = storage.set(&storage_key, &payload).await {
            warn!(key = %storage_key, "persisting authorization failed, keeping it in memory only: {e}");
        }
    }

    fn clear_locked(st: &mut AuthState) {
        st.cache.clear();
        st.in_flight.clear();
        st.epoch += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_normalizes() {
        let a = Address::from_bytes([1u8; 20]);
        let b = Address::from_bytes([2u8; 20]);
        let user = Address::from_bytes([9u8; 20]);
        assert_eq!(ScopeKey::new(user, &[b, a, b]), ScopeKey::new(user, &[a, b]));
        assert_ne!(ScopeKey::new(user, &[a]), ScopeKey::new(user, &[a, b]));
    }

    #[test]
    fn test_storage_suffix_depends_on_scope() {
        let user = Address::from_bytes([9u8; 20]);
        let one = ScopeKey::new(user, &[Address::from_bytes([1u8; 20])]);
        let two = ScopeKey::new(user, &[Address::from_bytes([2u8; 20])]);
        assert_ne!(one.storage_suffix(), two.storage_suffix());
        assert!(one.storage_suffix().starts_with("auth:0x0909"));
    }
}
