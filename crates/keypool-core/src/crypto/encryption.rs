//! AES-256-GCM authenticated encryption for stored API keys
//!
//! Serialized form: `v1:{nonce_hex}:{sealed_hex}` where `sealed` is the
//! ciphertext followed by the 16 byte tag. Callers bind each ciphertext to
//! its owner through associated data (the credential id), so a sealed key
//! copied onto another record fails to open.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use super::MasterKey;
use crate::error::{PoolError, Result};

const FORMAT_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A sealed value: nonce plus ciphertext with the GCM tag appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_LEN],
    pub sealed: Vec<u8>,
}

impl std::fmt::Display for EncryptedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            FORMAT_VERSION,
            hex::encode(self.nonce),
            hex::encode(&self.sealed)
        )
    }
}

impl std::str::FromStr for EncryptedData {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (version, nonce_hex, sealed_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(n), Some(c)) => (v, n, c),
            _ => {
                return Err(PoolError::DecryptionError(
                    "expected v1:nonce:ciphertext".to_string(),
                ))
            }
        };

        if version != FORMAT_VERSION {
            return Err(PoolError::DecryptionError(format!(
                "unsupported format version {:?}",
                version
            )));
        }

        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|e| PoolError::DecryptionError(format!("invalid nonce hex: {}", e)))?;
        let sealed = hex::decode(sealed_hex)
            .map_err(|e| PoolError::DecryptionError(format!("invalid ciphertext hex: {}", e)))?;

        let nonce: [u8; NONCE_LEN] = nonce_bytes.as_slice().try_into().map_err(|_| {
            PoolError::DecryptionError(format!(
                "invalid nonce length: expected {}, got {}",
                NONCE_LEN,
                nonce_bytes.len()
            ))
        })?;

        if sealed.len() < TAG_LEN {
            return Err(PoolError::DecryptionError("ciphertext shorter than tag".to_string()));
        }

        Ok(Self { nonce, sealed })
    }
}

/// Seal `plaintext` under `key`, authenticating `aad` alongside it
pub fn encrypt(plaintext: &[u8], key: &MasterKey, aad: &[u8]) -> Result<EncryptedData> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| PoolError::EncryptionError(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| PoolError::EncryptionError(e.to_string()))?;

    Ok(EncryptedData { nonce, sealed })
}

/// Open a sealed value; fails on a wrong key, wrong `aad` or tampering
pub fn decrypt(encrypted: &EncryptedData, key: &MasterKey, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| PoolError::DecryptionError(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(&encrypted.nonce),
            Payload { msg: encrypted.sealed.as_slice(), aad },
        )
        .map_err(|_| PoolError::DecryptionError("authentication failed".to_string()))
}

pub fn encrypt_string(plaintext: &str, key: &MasterKey, aad: &[u8]) -> Result<String> {
    Ok(encrypt(plaintext.as_bytes(), key, aad)?.to_string())
}

pub fn decrypt_string(encrypted: &str, key: &MasterKey, aad: &[u8]) -> Result<String> {
    let parsed: EncryptedData = encrypted.parse()?;
    let plaintext = decrypt(&parsed, key, aad)?;
    String::from_utf8(plaintext)
        .map_err(|e| PoolError::DecryptionError(format!("invalid UTF-8: {}", e)))
}
