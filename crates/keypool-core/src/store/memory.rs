//! Process-local credential store

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CredentialChange, CredentialEdit, CredentialStore, ResealFn};
use crate::credential::StoredCredential;
use crate::error::{PoolError, Result};

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<IndexMap<Uuid, StoredCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn list(&self) -> Result<Vec<StoredCredential>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredCredential>> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn save(&self, stored: &StoredCredential) -> Result<()> {
        self.entries.write().await.insert(stored.id(), stored.clone());
        Ok(())
    }

    async fn modify(&self, id: Uuid, edit: CredentialEdit<'_>) -> Result<CredentialChange> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(PoolError::CredentialNotFound(id))?;
        let previous = entry.credential.clone();
        edit(&mut entry.credential);
        Ok(CredentialChange {
            previous,
            current: entry.credential.clone(),
        })
    }

    async fn reseal_all(&self, reseal: ResealFn<'_>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let sealed = entries.values().map(reseal).collect::<Result<Vec<_>>>()?;
        for (entry, value) in entries.values_mut().zip(sealed) {
            entry.encrypted_value = value;
        }
        Ok(entries.len())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.entries.write().await.shift_remove(&id).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "In-Memory Store"
    }
}
