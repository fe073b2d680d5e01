//! JSON file credential store
//!
//! The pool lives in `pool.json` inside the data directory. Keys are sealed
//! individually, so the file itself holds no plaintext secrets. Every read
//! goes back to disk so that several processes sharing the directory see
//! each other's health updates; writes are load-modify-replace through a
//! temp file and an atomic rename.

use async_trait::async_trait;
use directories::ProjectDirs;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{CredentialChange, CredentialEdit, CredentialStore, ResealFn};
use crate::credential::StoredCredential;
use crate::error::{PoolError, Result};

const POOL_FILE: &str = "pool.json";
const FILE_VERSION: u32 = 1;

/// On-disk layout
#[derive(Debug, Serialize, Deserialize)]
struct PoolFile {
    version: u32,
    credentials: Vec<StoredCredential>,
}

pub struct FileCredentialStore {
    storage_dir: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Open the store in the platform data directory
    pub fn new() -> Result<Self> {
        Self::with_dir(Self::default_dir()?)
    }

    /// Open the store in `storage_dir`, creating it if needed
    pub fn with_dir(storage_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&storage_dir)?;
        debug!("File credential store at {:?}", storage_dir);

        Ok(Self {
            storage_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Platform data directory for keypool
    pub fn default_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "keypool", "keypool")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| PoolError::StorageError("could not determine data directory".to_string()))
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn pool_file_path(&self) -> PathBuf {
        self.storage_dir.join(POOL_FILE)
    }

    async fn load(&self) -> Result<IndexMap<Uuid, StoredCredential>> {
        let path = self.pool_file_path();

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IndexMap::new()),
            Err(e) => return Err(e.into()),
        };

        let file: PoolFile = serde_json::from_str(&contents)?;
        if file.version != FILE_VERSION {
            return Err(PoolError::StorageError(format!(
                "unsupported pool file version {}",
                file.version
            )));
        }

        Ok(file
            .credentials
            .into_iter()
            .map(|stored| (stored.id(), stored))
            .collect())
    }

    async fn persist(&self, entries: &IndexMap<Uuid, StoredCredential>) -> Result<()> {
        let file = PoolFile {
            version: FILE_VERSION,
            credentials: entries.values().cloned().collect(),
        };
        let contents = serde_json::to_string_pretty(&file)?;

        let path = self.pool_file_path();
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!("Saved {} credentials to {:?}", entries.len(), path);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn list(&self) -> Result<Vec<StoredCredential>> {
        Ok(self.load().await?.into_values().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredCredential>> {
        Ok(self.load().await?.shift_remove(&id))
    }

    async fn save(&self, stored: &StoredCredential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(stored.id(), stored.clone());
        self.persist(&entries).await
    }

    async fn modify(&self, id: Uuid, edit: CredentialEdit<'_>) -> Result<CredentialChange> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let entry = entries.get_mut(&id).ok_or(PoolError::CredentialNotFound(id))?;
        let previous = entry.credential.clone();
        edit(&mut entry.credential);
        let current = entry.credential.clone();
        self.persist(&entries).await?;
        Ok(CredentialChange { previous, current })
    }

    async fn reseal_all(&self, reseal: ResealFn<'_>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let sealed = entries.values().map(reseal).collect::<Result<Vec<_>>>()?;
        for (entry, value) in entries.values_mut().zip(sealed) {
            entry.encrypted_value = value;
        }
        self.persist(&entries).await?;
        Ok(entries.len())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        if entries.shift_remove(&id).is_none() {
            return Ok(false);
        }
        self.persist(&entries).await?;
        Ok(true)
    }

    fn backend_name(&self) -> &'static str {
        "JSON File Store"
    }
}
