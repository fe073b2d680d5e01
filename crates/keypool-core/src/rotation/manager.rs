//! Rotation manager: picks one usable key per request and applies the
//! cooldown / disable policy to reported outcomes.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::health::HealthReport;
use super::lease::Lease;
use crate::credential::{Credential, CredentialStatus, StoredCredential};
use crate::crypto::{decrypt_string, MasterKey, SecretString};
use crate::error::{PoolError, Result};
use crate::fallback::FallbackCredential;
use crate::rate::{minute_bucket, MemoryRateWindow, RateWindowCounter};
use crate::settings::PoolSettings;
use crate::store::{CredentialChange, CredentialStore};

/// Immutable view of the pool in rotation order
#[derive(Debug, Clone)]
struct PoolSnapshot {
    credentials: Vec<StoredCredential>,
    fetched_at: Instant,
}

impl PoolSnapshot {
    fn new(mut credentials: Vec<StoredCredential>) -> Self {
        // Stable: equal priorities keep store (insertion) order.
        credentials.sort_by_key(|stored| stored.credential.priority);
        Self {
            credentials,
            fetched_at: Instant::now(),
        }
    }

    /// First selectable key after `last_served`, wrapping around
    fn next_after(
        &self,
        last_served: Option<Uuid>,
        now: DateTime<Utc>,
        skipped: &HashSet<Uuid>,
    ) -> Option<&StoredCredential> {
        let len = self.credentials.len();
        let start = last_served
            .and_then(|id| self.credentials.iter().position(|s| s.id() == id))
            .map_or(0, |pos| pos + 1);

        (0..len)
            .map(|offset| &self.credentials[(start + offset) % len])
            .find(|stored| !skipped.contains(&stored.id()) && stored.credential.is_selectable(now))
    }

    fn find(&self, id: Uuid) -> Option<&Credential> {
        self.credentials
            .iter()
            .find(|stored| stored.id() == id)
            .map(|stored| &stored.credential)
    }
}

/// Shared rotation state
#[derive(Debug, Default)]
struct PoolState {
    snapshot: Option<Arc<PoolSnapshot>>,
    /// Set by `invalidate`; forces a refetch on the next access
    stale: bool,
    /// Selection cursor: the key served last
    last_served: Option<Uuid>,
}

/// Credential rotation manager
///
/// Construct once at startup and share through an `Arc`. All methods take
/// `&self` and are safe to call from concurrent tasks.
pub struct RotationManager {
    store: Arc<dyn CredentialStore>,
    counter: Arc<dyn RateWindowCounter>,
    master_key: MasterKey,
    fallback: Option<FallbackCredential>,
    settings: RwLock<Arc<PoolSettings>>,
    state: Mutex<PoolState>,
    /// Lets one task refetch the pool while the others wait for its result
    refresh_lock: Mutex<()>,
    /// Orders health updates so the snapshot sees them in store order
    health_lock: Mutex<()>,
}

impl RotationManager {
    /// Manager over `store` with default settings, a process-local rate
    /// window and no fallback key
    pub fn new(store: Arc<dyn CredentialStore>, master_key: MasterKey) -> Self {
        Self {
            store,
            counter: Arc::new(MemoryRateWindow::new()),
            master_key,
            fallback: None,
            settings: RwLock::new(Arc::new(PoolSettings::default())),
            state: Mutex::new(PoolState::default()),
            refresh_lock: Mutex::new(()),
            health_lock: Mutex::new(()),
        }
    }

    /// Use a shared rate window counter (required with several processes)
    pub fn with_counter(mut self, counter: Arc<dyn RateWindowCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_fallback(mut self, fallback: Option<FallbackCredential>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_settings(mut self, settings: PoolSettings) -> Self {
        self.settings = RwLock::new(Arc::new(settings));
        self
    }

    /// Current settings snapshot
    pub async fn settings(&self) -> Arc<PoolSettings> {
        self.settings.read().await.clone()
    }

    /// Swap in new settings. Calls already running keep the old snapshot.
    pub async fn reload_settings(&self, settings: PoolSettings) -> Result<()> {
        settings.validate()?;
        *self.settings.write().await = Arc::new(settings);
        info!("Pool settings reloaded");
        Ok(())
    }

    /// Select a key for one downstream request
    ///
    /// Walks the pool in priority order starting after the key served last,
    /// skipping keys that are disabled, cooling down or over their RPM
    /// limit for the current minute. Falls back to the static key when
    /// nothing in the pool is usable.
    pub async fn acquire(&self) -> Result<Lease> {
        let settings = self.settings().await;

        let snapshot = match self.current_snapshot(&settings).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return match &self.fallback {
                    Some(fallback) => {
                        warn!("Credential store unavailable ({}), serving fallback key", e);
                        Ok(Lease::fallback(fallback.secret().clone()))
                    }
                    None => Err(e),
                };
            }
        };

        let now = Utc::now();
        let bucket = minute_bucket(now);
        let mut skipped = HashSet::new();

        loop {
            let candidate = {
                let mut state = self.state.lock().await;
                let next = snapshot.next_after(state.last_served, now, &skipped).cloned();
                if let Some(stored) = &next {
                    state.last_served = Some(stored.id());
                }
                next
            };

            let Some(stored) = candidate else {
                break;
            };
            let credential = &stored.credential;

            let limit = u64::from(credential.rpm_limit);
            match self.counter.try_increment(credential.id, bucket, limit).await {
                Ok(None) => {
                    debug!(
                        "Key {} ...{} at its limit of {} rpm, skipping",
                        credential.label, credential.hint, credential.rpm_limit
                    );
                    skipped.insert(credential.id);
                    continue;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!("Rate window unavailable ({}), serving without rpm check", e);
                }
            }

            match self.open_secret(&stored) {
                Ok(secret) => {
                    debug!("Selected key {} ...{}", credential.label, credential.hint);
                    return Ok(Lease::pooled(stored.credential.clone(), secret));
                }
                Err(e) => {
                    error!(
                        "Cannot decrypt key {} ...{}: {}",
                        credential.label, credential.hint, e
                    );
                    skipped.insert(credential.id);
                }
            }
        }

        match &self.fallback {
            Some(fallback) => {
                warn!(
                    "No pooled key available ({} in pool), serving fallback key ...{}",
                    snapshot.credentials.len(),
                    fallback.hint()
                );
                Ok(Lease::fallback(fallback.secret().clone()))
            }
            None => Err(PoolError::PoolExhausted),
        }
    }

    /// Record a successful call made with `lease`
    pub async fn report_success(&self, lease: &Lease, latency_ms: u64) -> Result<()> {
        let Some(id) = lease.id() else {
            debug!("Fallback key call succeeded in {} ms", latency_ms);
            return Ok(());
        };

        self.update_health(id, |credential, _, now| credential.mark_success(latency_ms, now))
            .await?;
        Ok(())
    }

    /// Record a failed call made with `lease`
    ///
    /// Rate limits put the key into cooldown; the configured number of
    /// consecutive failures disables it until an administrator resets it.
    /// The fallback key is exempt from both.
    pub async fn report_error(&self, lease: &Lease, message: &str, is_rate_limit: bool) -> Result<()> {
        let Some(id) = lease.id() else {
            warn!("Fallback key call failed: {}", truncate(message, 100));
            return Ok(());
        };

        let change = self
            .update_health(id, |credential, settings, now| {
                credential.mark_error(message, is_rate_limit, settings.error_policy(), now)
            })
            .await?;
        let credential = &change.current;

        match credential.status {
            CredentialStatus::Disabled if change.previous.status != CredentialStatus::Disabled => {
                error!(
                    "Key {} ...{} disabled after {} consecutive errors",
                    credential.label, credential.hint, credential.error_count
                );
            }
            CredentialStatus::Disabled => {
                debug!(
                    "Key {} ...{} already disabled, error {} recorded",
                    credential.label, credential.hint, credential.error_count
                );
            }
            CredentialStatus::Cooldown => {
                warn!(
                    "Key {} ...{} rate limited, cooling down until {}",
                    credential.label,
                    credential.hint,
                    credential.cooldown_until.map(|t| t.to_rfc3339()).unwrap_or_default()
                );
            }
            _ => {
                debug!(
                    "Key {} ...{} error {} recorded",
                    credential.label, credential.hint, credential.error_count
                );
            }
        }

        Ok(())
    }

    /// Add usage to the key's daily counter
    pub async fn record_tokens(&self, lease: &Lease, tokens: u64) -> Result<()> {
        let Some(id) = lease.id() else {
            return Ok(());
        };

        self.update_health(id, |credential, _, now| credential.add_tokens(tokens, now))
            .await?;
        Ok(())
    }

    /// Health rows for every pooled key, plus the fallback when configured
    pub async fn health(&self) -> Result<Vec<HealthReport>> {
        let settings = self.settings().await;
        let snapshot = self.current_snapshot(&settings).await?;
        let now = Utc::now();
        let bucket = minute_bucket(now);

        let mut reports = Vec::with_capacity(snapshot.credentials.len() + 1);
        for stored in &snapshot.credentials {
            let used = self.counter.current(stored.id(), bucket).await?;
            reports.push(HealthReport::pooled(&stored.credential, used, now));
        }

        if let Some(fallback) = &self.fallback {
            reports.push(HealthReport::fallback(fallback.hint(), &settings.fallback_env));
        }

        Ok(reports)
    }

    /// Drop the cached snapshot; the next call refetches the pool
    pub async fn invalidate(&self) {
        self.state.lock().await.stale = true;
        debug!("Pool snapshot invalidated");
    }

    /// Refetch the pool now
    pub async fn refresh(&self) -> Result<usize> {
        self.invalidate().await;
        let settings = self.settings().await;
        let snapshot = self.current_snapshot(&settings).await?;
        Ok(snapshot.credentials.len())
    }

    /// The cached snapshot if still fresh, otherwise a new one from the
    /// store. When the store cannot be reached the old snapshot is served
    /// for another refresh interval.
    async fn current_snapshot(&self, settings: &PoolSettings) -> Result<Arc<PoolSnapshot>> {
        if let Some(snapshot) = self.fresh_snapshot(settings).await {
            return Ok(snapshot);
        }

        let _refresh = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited.
        if let Some(snapshot) = self.fresh_snapshot(settings).await {
            return Ok(snapshot);
        }

        match self.with_store(settings, || self.store.list()).await {
            Ok(credentials) => {
                let snapshot = Arc::new(PoolSnapshot::new(credentials));
                let mut state = self.state.lock().await;
                state.snapshot = Some(snapshot.clone());
                state.stale = false;
                debug!(
                    "Loaded {} keys from {}",
                    snapshot.credentials.len(),
                    self.store.backend_name()
                );
                Ok(snapshot)
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                let Some(old) = state.snapshot.clone() else {
                    error!("Credential store unavailable and no cached pool: {}", e);
                    return Err(e);
                };

                warn!(
                    "Credential store unavailable ({}), serving cached pool of {} keys",
                    e,
                    old.credentials.len()
                );
                let snapshot = Arc::new(PoolSnapshot {
                    credentials: old.credentials.clone(),
                    fetched_at: Instant::now(),
                });
                state.snapshot = Some(snapshot.clone());
                state.stale = false;
                Ok(snapshot)
            }
        }
    }

    async fn fresh_snapshot(&self, settings: &PoolSettings) -> Option<Arc<PoolSnapshot>> {
        let state = self.state.lock().await;
        state
            .snapshot
            .as_ref()
            .filter(|s| !state.stale && s.fetched_at.elapsed() < settings.refresh_interval())
            .cloned()
    }

    /// Apply a health change to one key as a single store step, then
    /// mirror the result into the cached snapshot. When the store is down
    /// the change lands in the cached copy only and the store error is
    /// returned.
    async fn update_health<F>(&self, id: Uuid, apply: F) -> Result<CredentialChange>
    where
        F: Fn(&mut Credential, &PoolSettings, DateTime<Utc>) + Send + Sync,
    {
        let settings = self.settings().await;
        let edit = |credential: &mut Credential| apply(credential, &*settings, Utc::now());
        let _ordered = self.health_lock.lock().await;

        match self.with_store(&settings, || self.store.modify(id, &edit)).await {
            Ok(change) => {
                self.patch_snapshot(&change.current).await;
                Ok(change)
            }
            Err(e @ PoolError::CredentialNotFound(_)) => Err(e),
            Err(e) => {
                let mut state = self.state.lock().await;
                let Some(snapshot) = state.snapshot.as_mut() else {
                    return Err(e);
                };
                let Some(stored) = Arc::make_mut(snapshot)
                    .credentials
                    .iter_mut()
                    .find(|stored| stored.id() == id)
                else {
                    return Err(e);
                };

                warn!("Credential store unavailable ({}), updating cached copy of {}", e, id);
                edit(&mut stored.credential);
                Err(e)
            }
        }
    }

    /// Copy-on-write update of one key in the cached snapshot
    async fn patch_snapshot(&self, credential: &Credential) {
        let mut state = self.state.lock().await;
        if let Some(snapshot) = state.snapshot.as_mut() {
            let snapshot = Arc::make_mut(snapshot);
            if let Some(stored) = snapshot
                .credentials
                .iter_mut()
                .find(|stored| stored.id() == credential.id)
            {
                stored.credential = credential.clone();
            }
        }
    }

    /// Run a store call with the configured timeout, retrying transient
    /// failures
    async fn with_store<T, F, Fut>(&self, settings: &PoolSettings, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = settings.store_retries.saturating_add(1);
        let mut last_error = PoolError::StoreTimeout(settings.store_timeout_ms);

        for attempt in 1..=attempts {
            match tokio::time::timeout(settings.store_timeout(), call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = PoolError::StoreTimeout(settings.store_timeout_ms),
            }
            if attempt < attempts {
                debug!("Store call failed (attempt {}/{}): {}", attempt, attempts, last_error);
            }
        }

        Err(last_error)
    }

    fn open_secret(&self, stored: &StoredCredential) -> Result<SecretString> {
        decrypt_string(&stored.encrypted_value, &self.master_key, stored.id().as_bytes())
            .map(SecretString::new)
    }
}

fn truncate(message: &str, limit: usize) -> String {
    message.chars().take(limit).collect()
}
