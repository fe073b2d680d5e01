//! End-to-end rotation behaviour over the in-memory and file stores

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

use keypool_core::store::{CredentialEdit, ResealFn};
use keypool_core::{
    Credential, CredentialAdmin, CredentialChange, CredentialStatus, CredentialStore,
    FallbackCredential, FileCredentialStore, MasterKey, MemoryCredentialStore, MemoryRateWindow,
    PoolError, PoolSettings, Result, RotationManager, StoredCredential,
};

fn master_key() -> MasterKey {
    MasterKey::new([42u8; 32])
}

/// Adds `(label, priority, rpm_limit)` keys in order
async fn seed(store: Arc<dyn CredentialStore>, keys: &[(&str, u32, u32)]) -> Vec<Credential> {
    let admin = CredentialAdmin::new(store, master_key());
    let mut added = Vec::new();
    for (label, priority, rpm) in keys {
        let secret = format!("sk-{}-secret-value", label);
        added.push(admin.add_key(label, "openai", &secret, *priority, *rpm).await.unwrap());
    }
    added
}

async fn labels_of(manager: &RotationManager, count: usize) -> Vec<String> {
    let mut labels = Vec::new();
    for _ in 0..count {
        let lease = manager.acquire().await.unwrap();
        labels.push(match lease.credential() {
            Some(c) => c.label.clone(),
            None => "fallback".to_string(),
        });
    }
    labels
}

#[tokio::test]
async fn test_two_keys_alternate() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 1, 100), ("B", 2, 100)]).await;
    let manager = RotationManager::new(store, master_key());

    assert_eq!(labels_of(&manager, 4).await, ["A", "B", "A", "B"]);
}

#[tokio::test]
async fn test_round_robin_is_fair() {
    let store = Arc::new(MemoryCredentialStore::new());
    let added = seed(
        store.clone(),
        &[("k1", 0, 100), ("k2", 0, 100), ("k3", 3, 100), ("k4", 1, 100)],
    )
    .await;
    let manager = RotationManager::new(store, master_key());

    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for _ in 0..(added.len() * 5) {
        let lease = manager.acquire().await.unwrap();
        *counts.entry(lease.id().unwrap()).or_default() += 1;
    }

    assert_eq!(counts.len(), added.len());
    assert!(counts.values().all(|&n| n == 5));
}

#[tokio::test]
async fn test_rate_limited_key_is_skipped() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 1, 100), ("B", 2, 100)]).await;
    let manager = RotationManager::new(store.clone(), master_key());

    let lease = manager.acquire().await.unwrap();
    assert_eq!(lease.credential().unwrap().label, "A");
    manager.report_error(&lease, "429 Too Many Requests", true).await.unwrap();

    // Cursor sits on A, but even after wrapping A stays out.
    assert_eq!(labels_of(&manager, 3).await, ["B", "B", "B"]);

    let stored = store.get(lease.id().unwrap()).await.unwrap().unwrap();
    assert_eq!(stored.credential.status, CredentialStatus::Cooldown);
}

#[tokio::test]
async fn test_rate_limit_sets_cooldown_window() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 100)]).await;
    let manager = RotationManager::new(store.clone(), master_key());

    let lease = manager.acquire().await.unwrap();
    // Prior plain errors do not change the outcome.
    manager.report_error(&lease, "upstream 500", false).await.unwrap();
    manager.report_error(&lease, "upstream 500", false).await.unwrap();

    let before = Utc::now();
    manager.report_error(&lease, "quota exceeded", true).await.unwrap();
    let after = Utc::now();

    let cred = store.get(lease.id().unwrap()).await.unwrap().unwrap().credential;
    let until = cred.cooldown_until.unwrap();
    assert_eq!(cred.status, CredentialStatus::Cooldown);
    assert!(until >= before + Duration::seconds(60));
    assert!(until <= after + Duration::seconds(60));
    assert_eq!(cred.error_count, 3);
}

#[tokio::test]
async fn test_five_errors_disable_until_reset() {
    let store = Arc::new(MemoryCredentialStore::new());
    let added = seed(store.clone(), &[("A", 0, 100), ("B", 1, 100)]).await;
    let manager = RotationManager::new(store.clone(), master_key());

    let lease = manager.acquire().await.unwrap();
    assert_eq!(lease.id(), Some(added[0].id));
    for _ in 0..5 {
        manager.report_error(&lease, "401 invalid api key", false).await.unwrap();
    }

    let cred = store.get(added[0].id).await.unwrap().unwrap().credential;
    assert_eq!(cred.status, CredentialStatus::Disabled);
    assert_eq!(labels_of(&manager, 4).await, ["B", "B", "B", "B"]);

    // Disabled survives a refetch from the store.
    manager.refresh().await.unwrap();
    assert_eq!(labels_of(&manager, 2).await, ["B", "B"]);

    CredentialAdmin::new(store.clone(), master_key())
        .reset_errors(added[0].id)
        .await
        .unwrap();
    manager.invalidate().await;

    let labels = labels_of(&manager, 2).await;
    assert!(labels.contains(&"A".to_string()));
}

#[tokio::test]
async fn test_success_resets_error_streak() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 100)]).await;
    let manager = RotationManager::new(store.clone(), master_key());

    let lease = manager.acquire().await.unwrap();
    for _ in 0..4 {
        manager.report_error(&lease, "timeout", false).await.unwrap();
    }
    manager.report_success(&lease, 250).await.unwrap();

    let cred = store.get(lease.id().unwrap()).await.unwrap().unwrap().credential;
    assert_eq!(cred.error_count, 0);
    assert_eq!(cred.status, CredentialStatus::Active);
    assert_eq!(cred.last_latency_ms, 250);
    assert_eq!(cred.total_requests, 5);

    // The streak starts over: four more errors do not disable.
    for _ in 0..4 {
        manager.report_error(&lease, "timeout", false).await.unwrap();
    }
    let cred = store.get(lease.id().unwrap()).await.unwrap().unwrap().credential;
    assert_eq!(cred.status, CredentialStatus::Active);
}

#[tokio::test]
async fn test_expired_cooldown_rejoins_rotation() {
    let store = Arc::new(MemoryCredentialStore::new());
    let added = seed(store.clone(), &[("A", 0, 100), ("B", 1, 100)]).await;

    let expired = Utc::now() - Duration::seconds(1);
    store
        .modify(added[0].id, &|c| {
            c.status = CredentialStatus::Cooldown;
            c.cooldown_until = Some(expired);
        })
        .await
        .unwrap();

    let manager = RotationManager::new(store, master_key());
    assert_eq!(labels_of(&manager, 2).await, ["A", "B"]);
}

#[tokio::test]
async fn test_empty_pool_without_fallback() {
    let store = Arc::new(MemoryCredentialStore::new());
    let manager = RotationManager::new(store, master_key());

    assert!(matches!(manager.acquire().await, Err(PoolError::PoolExhausted)));
}

#[tokio::test]
async fn test_exhausted_pool_without_fallback() {
    let store = Arc::new(MemoryCredentialStore::new());
    let added = seed(store.clone(), &[("A", 0, 100), ("B", 1, 100)]).await;
    let admin = CredentialAdmin::new(store.clone(), master_key());
    admin.disable(added[0].id).await.unwrap();

    let manager = RotationManager::new(store, master_key());
    let lease = manager.acquire().await.unwrap();
    manager.report_error(&lease, "rate limit", true).await.unwrap();

    assert!(matches!(manager.acquire().await, Err(PoolError::PoolExhausted)));
}

#[tokio::test]
async fn test_fallback_is_served_and_never_disabled() {
    let store = Arc::new(MemoryCredentialStore::new());
    let manager = RotationManager::new(store, master_key())
        .with_fallback(FallbackCredential::new("sk-env-fallback-0000"));

    for _ in 0..10 {
        let lease = manager.acquire().await.unwrap();
        assert!(lease.is_fallback());
        assert_eq!(lease.secret().expose(), "sk-env-fallback-0000");
        manager.report_error(&lease, "401 invalid api key", false).await.unwrap();
        manager.report_error(&lease, "429", true).await.unwrap();
    }

    let health = manager.health().await.unwrap();
    assert_eq!(health.len(), 1);
    assert!(health[0].is_fallback);
    assert!(health[0].is_available);
}

#[tokio::test]
async fn test_fallback_after_pool_runs_dry() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 100)]).await;
    let manager = RotationManager::new(store, master_key())
        .with_fallback(FallbackCredential::new("sk-env"));

    let lease = manager.acquire().await.unwrap();
    manager.report_error(&lease, "429", true).await.unwrap();

    assert!(manager.acquire().await.unwrap().is_fallback());
}

#[tokio::test]
async fn test_rpm_limit_moves_to_next_key() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 2), ("B", 1, 100)]).await;
    let manager = RotationManager::new(store, master_key());

    // A: 1st and 3rd picks fit its 2 rpm; the 5th would be its 3rd request.
    assert_eq!(labels_of(&manager, 6).await, ["A", "B", "A", "B", "B", "B"]);
}

#[tokio::test]
async fn test_rpm_limit_without_alternatives() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 1)]).await;
    let manager = RotationManager::new(store, master_key());

    manager.acquire().await.unwrap();
    assert!(matches!(manager.acquire().await, Err(PoolError::PoolExhausted)));
}

#[tokio::test]
async fn test_skipped_key_usage_not_inflated() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 2)]).await;
    let manager = RotationManager::new(store, master_key())
        .with_fallback(FallbackCredential::new("sk-env"));

    let labels = labels_of(&manager, 10).await;
    assert_eq!(labels.iter().filter(|l| *l == "A").count(), 2);

    let health = manager.health().await.unwrap();
    assert_eq!(health[0].rpm_limit, Some(2));
    assert_eq!(health[0].requests_this_minute, 2);
}

#[tokio::test]
async fn test_shared_counter_limits_across_managers() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 3)]).await;
    let counter = Arc::new(MemoryRateWindow::new());

    let first = RotationManager::new(store.clone(), master_key()).with_counter(counter.clone());
    let second = RotationManager::new(store, master_key()).with_counter(counter);

    first.acquire().await.unwrap();
    second.acquire().await.unwrap();
    first.acquire().await.unwrap();
    assert!(matches!(second.acquire().await, Err(PoolError::PoolExhausted)));
    assert!(matches!(first.acquire().await, Err(PoolError::PoolExhausted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_errors_disable_key() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FileCredentialStore::with_dir(temp_dir.path().to_path_buf()).unwrap());
    seed(store.clone(), &[("A", 0, 100)]).await;
    let manager = Arc::new(RotationManager::new(store.clone(), master_key()));
    let lease = Arc::new(manager.acquire().await.unwrap());

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        let lease = lease.clone();
        handles.push(tokio::spawn(async move {
            manager.report_error(&lease, "boom", false).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let cred = store.get(lease.id().unwrap()).await.unwrap().unwrap().credential;
    assert_eq!(cred.error_count, 5);
    assert_eq!(cred.total_requests, 5);
    assert_eq!(cred.status, CredentialStatus::Disabled);
    assert!(matches!(manager.acquire().await, Err(PoolError::PoolExhausted)));
}

#[tokio::test]
async fn test_health_reports_usage() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 2)]).await;
    let manager = RotationManager::new(store, master_key());

    let lease = manager.acquire().await.unwrap();
    manager.record_tokens(&lease, 1200).await.unwrap();
    manager.acquire().await.unwrap();

    let health = manager.health().await.unwrap();
    assert_eq!(health.len(), 1);
    let row = &health[0];
    assert_eq!(row.label, "A");
    assert_eq!(row.hint, "alue");
    assert_eq!(row.requests_this_minute, 2);
    assert_eq!(row.tokens_used_today, 1200);
    assert!(!row.is_available);

    let json = serde_json::to_value(row).unwrap();
    assert_eq!(json["status"], "active");
    assert_eq!(json["rpmLimit"], 2);
}

#[tokio::test]
async fn test_concurrent_acquire_spreads_load() {
    let store = Arc::new(MemoryCredentialStore::new());
    let added = seed(store.clone(), &[("A", 0, 1000), ("B", 0, 1000), ("C", 0, 1000)]).await;
    let manager = Arc::new(RotationManager::new(store, master_key()));

    let mut handles = Vec::new();
    for _ in 0..30 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.acquire().await.unwrap().id().unwrap() }));
    }

    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for handle in handles {
        *counts.entry(handle.await.unwrap()).or_default() += 1;
    }

    for cred in &added {
        assert_eq!(counts.get(&cred.id), Some(&10));
    }
}

/// Store that can be switched off to simulate an outage
struct FlakyStore {
    inner: MemoryCredentialStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PoolError::StorageError("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FlakyStore {
    async fn list(&self) -> Result<Vec<StoredCredential>> {
        self.check()?;
        self.inner.list().await
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredCredential>> {
        self.check()?;
        self.inner.get(id).await
    }

    async fn save(&self, stored: &StoredCredential) -> Result<()> {
        self.check()?;
        self.inner.save(stored).await
    }

    async fn modify(&self, id: Uuid, edit: CredentialEdit<'_>) -> Result<CredentialChange> {
        self.check()?;
        self.inner.modify(id, edit).await
    }

    async fn reseal_all(&self, reseal: ResealFn<'_>) -> Result<usize> {
        self.check()?;
        self.inner.reseal_all(reseal).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.check()?;
        self.inner.delete(id).await
    }

    fn backend_name(&self) -> &'static str {
        "Flaky Store"
    }
}

fn quick_settings() -> PoolSettings {
    PoolSettings {
        store_timeout_ms: 50,
        store_retries: 1,
        ..PoolSettings::default()
    }
}

#[tokio::test]
async fn test_outage_serves_cached_pool() {
    let store = Arc::new(FlakyStore {
        inner: MemoryCredentialStore::new(),
        down: AtomicBool::new(false),
    });
    seed(store.clone(), &[("A", 0, 100), ("B", 1, 100)]).await;

    let manager = RotationManager::new(store.clone(), master_key()).with_settings(quick_settings());
    assert_eq!(labels_of(&manager, 1).await, ["A"]);

    store.down.store(true, Ordering::SeqCst);
    manager.invalidate().await;

    assert_eq!(labels_of(&manager, 3).await, ["B", "A", "B"]);

    // Writes fail, but the cached view still takes the cooldown.
    let lease = manager.acquire().await.unwrap();
    assert_eq!(lease.credential().unwrap().label, "A");
    assert!(manager.report_error(&lease, "429", true).await.is_err());
    assert_eq!(labels_of(&manager, 2).await, ["B", "B"]);
}

#[tokio::test]
async fn test_outage_before_first_load() {
    let store = Arc::new(FlakyStore {
        inner: MemoryCredentialStore::new(),
        down: AtomicBool::new(true),
    });

    let bare = RotationManager::new(store.clone(), master_key()).with_settings(quick_settings());
    assert!(matches!(bare.acquire().await, Err(PoolError::StorageError(_))));

    let with_fallback = RotationManager::new(store, master_key())
        .with_settings(quick_settings())
        .with_fallback(FallbackCredential::new("sk-env"));
    assert!(with_fallback.acquire().await.unwrap().is_fallback());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_refreshes_after_interval() {
    let store = Arc::new(MemoryCredentialStore::new());
    seed(store.clone(), &[("A", 0, 100)]).await;
    let manager = RotationManager::new(store.clone(), master_key());

    assert_eq!(labels_of(&manager, 1).await, ["A"]);

    // Added behind the manager's back: invisible until the snapshot ages out.
    seed(store.clone(), &[("B", 0, 100)]).await;
    assert_eq!(labels_of(&manager, 2).await, ["A", "A"]);

    tokio::time::advance(std::time::Duration::from_secs(301)).await;
    assert_eq!(labels_of(&manager, 2).await, ["B", "A"]);
}

#[tokio::test]
async fn test_processes_share_file_store() {
    let temp_dir = TempDir::new().unwrap();
    let store_a = Arc::new(FileCredentialStore::with_dir(temp_dir.path().to_path_buf()).unwrap());
    let store_b = Arc::new(FileCredentialStore::with_dir(temp_dir.path().to_path_buf()).unwrap());
    let added = seed(store_a.clone(), &[("A", 0, 100), ("B", 1, 100)]).await;

    let first = RotationManager::new(store_a, master_key());
    let second = RotationManager::new(store_b, master_key());

    let lease = first.acquire().await.unwrap();
    for _ in 0..5 {
        first.report_error(&lease, "invalid key", false).await.unwrap();
    }

    // The second manager loads after the writes and never serves A.
    assert_eq!(labels_of(&second, 3).await, ["B", "B", "B"]);

    let health = second.health().await.unwrap();
    let a = health.iter().find(|row| row.id == Some(added[0].id)).unwrap();
    assert_eq!(a.status, CredentialStatus::Disabled);
    assert_eq!(a.error_count, 5);
}
