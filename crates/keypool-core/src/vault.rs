//! Vault: derives and verifies the key that seals pooled API keys
//!
//! The vault key comes from an operator passphrase through Argon2id and is
//! unrelated to any application secret. `vault.json` keeps the salt, the
//! cost parameters and a sealed known plaintext used to check the
//! passphrase.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::credential::StoredCredential;
use crate::crypto::{
    decrypt_string, derive_key, encrypt_string, generate_salt, KeyDerivationParams, MasterKey, SecretString,
};
use crate::error::{PoolError, Result};
use crate::store::CredentialStore;

const VAULT_FILE: &str = "vault.json";
const VERIFICATION_PLAINTEXT: &str = "keypool-vault-verification";
const VERIFICATION_AAD: &[u8] = b"keypool-vault";

/// Vault state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    /// No `vault.json` yet
    NotInitialized,
    /// Initialized, passphrase required
    Locked,
    /// Key derived and verified
    Unlocked,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultFile {
    version: u32,
    salt: String,
    memory_cost: u32,
    time_cost: u32,
    parallelism: u32,
    verification: String,
}

impl VaultFile {
    fn params(&self) -> KeyDerivationParams {
        KeyDerivationParams {
            memory_cost: self.memory_cost,
            time_cost: self.time_cost,
            parallelism: self.parallelism,
        }
    }
}

pub struct Vault {
    storage_dir: PathBuf,
    params: KeyDerivationParams,
    master_key: Option<MasterKey>,
}

impl Vault {
    /// Vault rooted at `storage_dir`
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            storage_dir: storage_dir.to_path_buf(),
            params: KeyDerivationParams::default(),
            master_key: None,
        }
    }

    /// Cost parameters used by `initialize` and `change_passphrase`
    pub fn with_params(mut self, params: KeyDerivationParams) -> Self {
        self.params = params;
        self
    }

    fn vault_file_path(&self) -> PathBuf {
        self.storage_dir.join(VAULT_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.vault_file_path().exists()
    }

    pub fn state(&self) -> VaultState {
        if self.master_key.is_some() {
            VaultState::Unlocked
        } else if self.is_initialized() {
            VaultState::Locked
        } else {
            VaultState::NotInitialized
        }
    }

    /// The unlocked key
    pub fn master_key(&self) -> Result<&MasterKey> {
        self.master_key.as_ref().ok_or(PoolError::VaultLocked)
    }

    /// Create a new vault protected by `passphrase`
    pub async fn initialize(&mut self, passphrase: &str) -> Result<MasterKey> {
        if self.is_initialized() {
            return Err(PoolError::StorageError("vault already initialized".to_string()));
        }

        tokio::fs::create_dir_all(&self.storage_dir).await?;
        let master_key = self.write_vault(passphrase).await?;
        self.master_key = Some(master_key.clone());

        info!("Vault initialized at {:?}", self.storage_dir);
        Ok(master_key)
    }

    /// Derive the key from `passphrase` and check it against the vault
    pub async fn unlock(&mut self, passphrase: &str) -> Result<MasterKey> {
        let file = self.read_vault().await?;
        let master_key = derive_key(passphrase, &file.salt, file.params())?;

        match decrypt_string(&file.verification, &master_key, VERIFICATION_AAD) {
            Ok(plaintext) if plaintext == VERIFICATION_PLAINTEXT => {}
            _ => {
                debug!("Vault passphrase verification failed");
                return Err(PoolError::InvalidPassphrase);
            }
        }

        self.master_key = Some(master_key.clone());
        debug!("Vault unlocked");
        Ok(master_key)
    }

    /// Forget the key
    pub fn lock(&mut self) {
        self.master_key = None;
        debug!("Vault locked");
    }

    /// Switch to a new passphrase and reseal every key in `store`
    ///
    /// The new `vault.json` is staged first and only swapped in after the
    /// whole pool has been resealed in one store write, so a failure at any
    /// point leaves the old passphrase working.
    pub async fn change_passphrase(
        &mut self,
        old_passphrase: &str,
        new_passphrase: &str,
        store: &dyn CredentialStore,
    ) -> Result<MasterKey> {
        let old_key = self.unlock(old_passphrase).await?;
        let (file, new_key) = self.prepare_vault(new_passphrase)?;

        let path = self.vault_file_path();
        let staged_path = path.with_extension("pending");
        tokio::fs::write(&staged_path, serde_json::to_string_pretty(&file)?).await?;

        let reseal = |stored: &StoredCredential| {
            let aad = stored.id();
            let plaintext = SecretString::new(decrypt_string(
                &stored.encrypted_value,
                &old_key,
                aad.as_bytes(),
            )?);
            encrypt_string(plaintext.expose(), &new_key, aad.as_bytes())
        };
        let count = match store.reseal_all(&reseal).await {
            Ok(count) => count,
            Err(e) => {
                tokio::fs::remove_file(&staged_path).await.ok();
                warn!("Passphrase change aborted, pool left unchanged: {}", e);
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&staged_path, &path).await {
            error!(
                "Pool resealed but {:?} could not replace {:?}: {}",
                staged_path, path, e
            );
            return Err(e.into());
        }

        self.master_key = Some(new_key.clone());
        info!("Vault passphrase changed, {} keys resealed", count);
        Ok(new_key)
    }

    async fn read_vault(&self) -> Result<VaultFile> {
        let path = self.vault_file_path();
        if !path.exists() {
            return Err(PoolError::VaultNotInitialized);
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn prepare_vault(&self, passphrase: &str) -> Result<(VaultFile, MasterKey)> {
        let salt = generate_salt();
        let master_key = derive_key(passphrase, &salt, self.params)?;

        let file = VaultFile {
            version: 1,
            salt,
            memory_cost: self.params.memory_cost,
            time_cost: self.params.time_cost,
            parallelism: self.params.parallelism,
            verification: encrypt_string(VERIFICATION_PLAINTEXT, &master_key, VERIFICATION_AAD)?,
        };
        Ok((file, master_key))
    }

    async fn write_vault(&self, passphrase: &str) -> Result<MasterKey> {
        let (file, master_key) = self.prepare_vault(passphrase)?;

        let path = self.vault_file_path();
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, serde_json::to_string_pretty(&file)?).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        Ok(master_key)
    }
}
