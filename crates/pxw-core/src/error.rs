use thiserror::Error;

pub type PxwResult<T> = Result<T, PxwError>;

#[derive(Debug, Error)]
pub enum PxwError {
    #[error("RPC endpoint {url} is not a Web3 node or is not reachable: {reason}")]
    RpcUnreachable { url: String, reason: String },

    #[error("simulation metadata from {url} is missing or malformed: {reason}")]
    SimulationMetadata { url: String, reason: String },

    #[error("relayer SDK failed to load from both {primary} and {fallback}")]
    SdkLoad { primary: String, fallback: String },

    #[error("relayer SDK initialization failed: {0}")]
    SdkInit(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("encryption instance creation failed: {0}")]
    InstanceCreate(String),

    #[error("encryption instance is not ready")]
    NotReady,

    #[error("authorization error: {0}")]
    Authorization(#[from] AuthError),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("value {0} is outside the 32-bit encryption domain")]
    InvalidValue(u64),

    #[error("invalid colour {0:?}: expected #RRGGBB")]
    InvalidColor(String),

    #[error("storage capacity exceeded writing {key}")]
    QuotaExceeded { key: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("operation was cancelled")]
    Aborted,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Authorization failures are shared between every waiter of a single
/// in-flight derivation, so they must be cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("signature request rejected: {0}")]
    SigningRejected(String),

    #[error("no signer connected")]
    NoSigner,

    #[error("no encryption instance available")]
    NoInstance,

    #[error("authorization derivation was cancelled")]
    Aborted,

    #[error("instance rejected authorization request: {0}")]
    Instance(String),
}

impl PxwError {
    /// Stable machine-readable code for each condition.
    pub fn code(&self) -> &'static str {
        match self {
            PxwError::RpcUnreachable { .. } => "WEB3_CLIENTVERSION_ERROR",
            PxwError::SimulationMetadata { .. } => "FHEVM_RELAYER_METADATA_ERROR",
            PxwError::SdkLoad { .. } => "SDK_LOAD_ERROR",
            PxwError::SdkInit(_) => "SDK_INIT_ERROR",
            PxwError::InvalidAddress(_) => "INVALID_ADDRESS",
            PxwError::InstanceCreate(_) => "INSTANCE_CREATE_ERROR",
            PxwError::NotReady => "INSTANCE_NOT_READY",
            PxwError::Authorization(AuthError::Aborted) => "ABORTED",
            PxwError::Authorization(_) => "AUTHORIZATION_ERROR",
            PxwError::Decrypt(_) => "DECRYPT_ERROR",
            PxwError::InvalidValue(_) => "INVALID_VALUE",
            PxwError::InvalidColor(_) => "INVALID_COLOR",
            PxwError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            PxwError::Storage(_) => "STORAGE_ERROR",
            PxwError::Ledger(_) => "LEDGER_ERROR",
            PxwError::Aborted => "ABORTED",
            PxwError::Config(_) => "CONFIG_ERROR",
            PxwError::Io(_) => "IO_ERROR",
            PxwError::Other(_) => "OTHER",
        }
    }

    /// True for failures worth retrying unchanged (network flakiness,
    /// relayer hiccups). Misconfiguration is terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PxwError::RpcUnreachable { .. }
                | PxwError::SdkLoad { .. }
                | PxwError::Decrypt(_)
                | PxwError::Ledger(_)
                | PxwError::Io(_)
        )
    }

    /// Cancellation is never surfaced to the end user.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            PxwError::Aborted | PxwError::Authorization(AuthError::Aborted)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let unreachable = PxwError::RpcUnreachable {
            url: "http://localhost:8545".into(),
            reason: "connection refused".into(),
        };
        assert!(unreachable.is_transient());
        assert!(PxwError::Decrypt("relayer 503".into()).is_transient());
        assert!(!PxwError::InvalidAddress("0x12".into()).is_transient());
        assert!(!PxwError::SdkInit("returned false".into()).is_transient());
    }

    #[test]
    fn test_abort_classification() {
        assert!(PxwError::Aborted.is_abort());
        assert!(PxwError::from(AuthError::Aborted).is_abort());
        assert!(!PxwError::from(AuthError::NoSigner).is_abort());
        assert_eq!(PxwError::Aborted.code(), "ABORTED");
    }

    #[test]
    fn test_codes_are_distinct_for_bootstrap_failures() {
        let codes = [
            PxwError::RpcUnreachable { url: String::new(), reason: String::new() }.code(),
            PxwError::SimulationMetadata { url: String::new(), reason: String::new() }.code(),
            PxwError::SdkLoad { primary: String::new(), fallback: String::new() }.code(),
            PxwError::SdkInit(String::new()).code(),
            PxwError::InvalidAddress(String::new()).code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }
}
