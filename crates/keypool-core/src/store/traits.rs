//! Storage trait definitions

use async_trait::async_trait;
use uuid::Uuid;

use crate::credential::{Credential, StoredCredential};
use crate::error::Result;

/// Metadata edit applied inside the store's write critical section
pub type CredentialEdit<'a> = &'a (dyn Fn(&mut Credential) + Send + Sync);

/// Produces the new sealed value for an entry during a reseal
pub type ResealFn<'a> = &'a (dyn Fn(&StoredCredential) -> Result<String> + Send + Sync);

/// A credential as it was before and after a `modify`
#[derive(Debug, Clone)]
pub struct CredentialChange {
    pub previous: Credential,
    pub current: Credential,
}

/// Persistent home of the pool. Implementations return credentials in
/// insertion order, which breaks priority ties during rotation.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// All credentials, in insertion order
    async fn list(&self) -> Result<Vec<StoredCredential>>;

    async fn get(&self, id: Uuid) -> Result<Option<StoredCredential>>;

    /// Insert a new credential or replace an existing one in place
    async fn save(&self, stored: &StoredCredential) -> Result<()>;

    /// Read, edit and write one credential's metadata as a single step.
    /// Concurrent edits of the same credential never overwrite each other.
    /// The sealed key is left as is.
    async fn modify(&self, id: Uuid, edit: CredentialEdit<'_>) -> Result<CredentialChange>;

    /// Replace the sealed value of every entry in one write. Nothing is
    /// written if `reseal` fails for any entry. Returns the entry count.
    async fn reseal_all(&self, reseal: ResealFn<'_>) -> Result<usize>;

    /// Remove a credential; returns whether it existed
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Human-readable backend name
    fn backend_name(&self) -> &'static str;
}
