//! Administrative operations on the pool
//!
//! Adding keys, editing rotation parameters and the manual reset that brings
//! a disabled key back. The rotation manager never deletes; this does.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{Credential, CredentialStatus, StoredCredential};
use crate::crypto::{decrypt_string, encrypt_string, MasterKey, SecretString};
use crate::error::{PoolError, Result};
use crate::store::CredentialStore;

/// Accepted range for per-key requests per minute
pub const RPM_LIMIT_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;

pub struct CredentialAdmin {
    store: Arc<dyn CredentialStore>,
    master_key: MasterKey,
}

impl CredentialAdmin {
    pub fn new(store: Arc<dyn CredentialStore>, master_key: MasterKey) -> Self {
        Self { store, master_key }
    }

    /// Seal and add a new key to the pool
    pub async fn add_key(
        &self,
        label: &str,
        provider: &str,
        secret: &str,
        priority: u32,
        rpm_limit: u32,
    ) -> Result<Credential> {
        let secret = SecretString::new(secret.trim().to_string());
        if secret.is_empty() {
            return Err(PoolError::InvalidCredential("API key is empty".to_string()));
        }
        validate_rpm_limit(rpm_limit)?;

        let credential = Credential::new(label, provider, secret.hint(), priority, rpm_limit);
        let encrypted_value = encrypt_string(
            secret.expose(),
            &self.master_key,
            credential.id.as_bytes(),
        )?;

        self.store
            .save(&StoredCredential {
                credential: credential.clone(),
                encrypted_value,
            })
            .await?;

        info!(
            "Added key {} ({}) ...{} with priority {}",
            credential.label, credential.provider, credential.hint, credential.priority
        );
        Ok(credential)
    }

    pub async fn get(&self, id: Uuid) -> Result<Credential> {
        Ok(self.get_stored(id).await?.credential)
    }

    /// All keys in rotation order
    pub async fn list(&self) -> Result<Vec<Credential>> {
        let mut credentials: Vec<Credential> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|stored| stored.credential)
            .collect();
        // Stable sort keeps insertion order among equal priorities.
        credentials.sort_by_key(|c| c.priority);
        Ok(credentials)
    }

    /// Decrypt a stored key
    pub async fn reveal(&self, id: Uuid) -> Result<SecretString> {
        let stored = self.get_stored(id).await?;
        let plaintext = decrypt_string(&stored.encrypted_value, &self.master_key, id.as_bytes())?;
        debug!("Revealed key {}", id);
        Ok(SecretString::new(plaintext))
    }

    /// Replace the key value, keeping health history
    pub async fn update_secret(&self, id: Uuid, secret: &str) -> Result<Credential> {
        let secret = SecretString::new(secret.trim().to_string());
        if secret.is_empty() {
            return Err(PoolError::InvalidCredential("API key is empty".to_string()));
        }

        let mut stored = self.get_stored(id).await?;
        stored.encrypted_value = encrypt_string(secret.expose(), &self.master_key, id.as_bytes())?;
        stored.credential.hint = secret.hint();
        stored.credential.updated_at = Utc::now();
        self.store.save(&stored).await?;

        info!("Replaced key value for {} (now ...{})", id, stored.credential.hint);
        Ok(stored.credential)
    }

    pub async fn set_priority(&self, id: Uuid, priority: u32) -> Result<Credential> {
        self.modify(id, |c| c.priority = priority).await
    }

    pub async fn set_rpm_limit(&self, id: Uuid, rpm_limit: u32) -> Result<Credential> {
        validate_rpm_limit(rpm_limit)?;
        self.modify(id, |c| c.rpm_limit = rpm_limit).await
    }

    /// Clear the error streak and any cooldown; the only way out of `disabled`
    pub async fn reset_errors(&self, id: Uuid) -> Result<Credential> {
        let credential = self.modify(id, |c| c.reset(Utc::now())).await?;
        info!("Reset key {} ...{}", credential.label, credential.hint);
        Ok(credential)
    }

    /// Put a key back into rotation without clearing its error streak
    pub async fn enable(&self, id: Uuid) -> Result<Credential> {
        self.modify(id, |c| {
            c.status = CredentialStatus::Active;
            c.cooldown_until = None;
        })
        .await
    }

    /// Take a key out of rotation
    pub async fn disable(&self, id: Uuid) -> Result<Credential> {
        let credential = self
            .modify(id, |c| c.status = CredentialStatus::Disabled)
            .await?;
        info!("Disabled key {} ...{}", credential.label, credential.hint);
        Ok(credential)
    }

    /// Flag a key as broken (e.g. failed a connection test)
    pub async fn flag_error(&self, id: Uuid, message: &str) -> Result<Credential> {
        self.modify(id, |c| {
            c.status = CredentialStatus::Error;
            c.last_error = Some(message.to_string());
            c.last_error_at = Some(Utc::now());
        })
        .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.store.delete(id).await? {
            return Err(PoolError::CredentialNotFound(id));
        }
        info!("Deleted key {}", id);
        Ok(())
    }

    async fn get_stored(&self, id: Uuid) -> Result<StoredCredential> {
        self.store
            .get(id)
            .await?
            .ok_or(PoolError::CredentialNotFound(id))
    }

    async fn modify<F>(&self, id: Uuid, apply: F) -> Result<Credential>
    where
        F: Fn(&mut Credential) + Send + Sync,
    {
        let edit = |credential: &mut Credential| {
            apply(credential);
            credential.updated_at = Utc::now();
        };
        Ok(self.store.modify(id, &edit).await?.current)
    }
}

fn validate_rpm_limit(rpm_limit: u32) -> Result<()> {
    if !RPM_LIMIT_RANGE.contains(&rpm_limit) {
        return Err(PoolError::InvalidCredential(format!(
            "rpm limit must be between {} and {}, got {}",
            RPM_LIMIT_RANGE.start(),
            RPM_LIMIT_RANGE.end(),
            rpm_limit
        )));
    }
    Ok(())
}
