//! Argon2id derivation of the vault key

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;

use super::MasterKey;
use crate::error::{PoolError, Result};

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDerivationParams {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Iterations
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KeyDerivationParams {
    fn default() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KeyDerivationParams {
    /// Cheap parameters for tests and throwaway pools
    pub fn light() -> Self {
        Self {
            memory_cost: 8192,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// Random salt in PHC base64 form
pub fn generate_salt() -> String {
    SaltString::generate(&mut OsRng).to_string()
}

/// Derive a 256-bit vault key from `passphrase` and `salt`
pub fn derive_key(passphrase: &str, salt: &str, params: KeyDerivationParams) -> Result<MasterKey> {
    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| PoolError::KeyDerivationError(e.to_string()))?;

    let salt = SaltString::from_b64(salt)
        .map_err(|e| PoolError::KeyDerivationError(format!("invalid salt: {}", e)))?;

    let hash = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| PoolError::KeyDerivationError(e.to_string()))?
        .hash
        .ok_or_else(|| PoolError::KeyDerivationError("no hash output".to_string()))?;

    MasterKey::new_from_slice(hash.as_bytes())
        .ok_or_else(|| PoolError::KeyDerivationError("hash output too short".to_string()))
}
