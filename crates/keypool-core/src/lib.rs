//! # keypool-core
//!
//! API key pool management for rate-limited downstream providers:
//! - Round-robin rotation ordered by priority
//! - Health tracking with automatic cooldown and disable
//! - Per-key requests-per-minute windows
//! - AES-256-GCM encrypted key storage with an Argon2id-derived vault key
//! - Static fallback key when the pool is empty or exhausted

pub mod crypto;
pub mod credential;
pub mod error;
pub mod fallback;
pub mod rate;
pub mod rotation;
pub mod settings;
pub mod store;
mod vault;

pub use error::{PoolError, Result};
pub use vault::{Vault, VaultState};
pub use crypto::{MasterKey, SecretString, encrypt_string, decrypt_string, generate_salt};
pub use credential::{Credential, CredentialAdmin, CredentialStatus, StoredCredential};
pub use fallback::FallbackCredential;
pub use rate::{minute_bucket, MemoryRateWindow, RateWindowCounter};
pub use rotation::{is_rate_limit_error, HealthReport, Lease, LeaseSource, RotationManager};
pub use settings::{PoolSettings, SettingsManager};
pub use store::{CredentialChange, CredentialStore, FileCredentialStore, MemoryCredentialStore};
