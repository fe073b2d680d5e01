//! Error types for keypool-core

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Pool error types
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No usable API key: the pool is empty or exhausted and no fallback key is configured")]
    PoolExhausted,

    #[error("Vault is locked - unlock with the passphrase first")]
    VaultLocked,

    #[error("Vault is not initialized - run `keypool init` first")]
    VaultNotInitialized,

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Credential not found: {0}")]
    CredentialNotFound(Uuid),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Credential store did not answer within {0} ms")]
    StoreTimeout(u64),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl PoolError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PoolError::StoreTimeout(_) | PoolError::StorageError(_) | PoolError::IoError(_)
        )
    }
}
