//! Cryptographic primitives for pooled key storage
//!
//! - AES-256-GCM authenticated encryption of each stored key
//! - Argon2id derivation of the vault key from a passphrase
//! - Zeroize-on-drop wrappers for key material and decrypted secrets

mod encryption;
mod key_derivation;
mod secure_memory;

pub use encryption::{decrypt, decrypt_string, encrypt, encrypt_string, EncryptedData};
pub use key_derivation::{derive_key, generate_salt, KeyDerivationParams};
pub use secure_memory::{MasterKey, SecretString};
