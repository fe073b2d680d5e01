//! Pool settings
//!
//! Stored as plain JSON next to the pool. The rotation manager holds an
//! immutable `Arc<PoolSettings>` snapshot and swaps it whole on reload, so a
//! call in flight always sees one consistent set of values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::credential::ErrorPolicy;
use crate::error::{PoolError, Result};

const SETTINGS_FILE: &str = "settings.json";

/// Longest accepted cooldown: one day
pub const MAX_COOLDOWN_SECS: u64 = 86_400;

/// Rotation and health policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Settings file version
    pub version: u32,
    /// How long a rate-limited key sits out
    pub cooldown_secs: u64,
    /// Consecutive failures that disable a key
    pub disable_threshold: u32,
    /// Maximum age of the cached pool snapshot
    pub refresh_interval_secs: u64,
    /// Bound on each credential store call
    pub store_timeout_ms: u64,
    /// Extra attempts after a failed or timed out store call
    pub store_retries: u32,
    /// Stored error messages are cut to this many characters
    pub error_message_limit: usize,
    /// RPM limit given to keys added without one
    pub default_rpm_limit: u32,
    /// Environment variable holding the fallback key
    pub fallback_env: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            version: 1,
            cooldown_secs: 60,
            disable_threshold: 5,
            refresh_interval_secs: 300,
            store_timeout_ms: 2000,
            store_retries: 2,
            error_message_limit: 500,
            default_rpm_limit: 15,
            fallback_env: "KEYPOOL_FALLBACK_KEY".to_string(),
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<()> {
        if self.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(PoolError::InvalidSettings(format!(
                "cooldownSecs must be at most {}, got {}",
                MAX_COOLDOWN_SECS, self.cooldown_secs
            )));
        }
        if self.disable_threshold == 0 {
            return Err(PoolError::InvalidSettings(
                "disableThreshold must be at least 1".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(PoolError::InvalidSettings(
                "storeTimeoutMs must be at least 1".to_string(),
            ));
        }
        if !(1..=1000).contains(&self.default_rpm_limit) {
            return Err(PoolError::InvalidSettings(format!(
                "defaultRpmLimit must be between 1 and 1000, got {}",
                self.default_rpm_limit
            )));
        }
        if self.fallback_env.trim().is_empty() {
            return Err(PoolError::InvalidSettings("fallbackEnv is empty".to_string()));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy {
            // Settings built in code skip `validate`; clamp here as well.
            cooldown: chrono::Duration::seconds(self.cooldown_secs.min(MAX_COOLDOWN_SECS) as i64),
            disable_threshold: self.disable_threshold,
            message_limit: self.error_message_limit,
        }
    }
}

/// Loads and saves `settings.json`
pub struct SettingsManager {
    settings_file: PathBuf,
    settings: PoolSettings,
}

impl SettingsManager {
    /// Load settings from `storage_dir`, using defaults when the file is absent
    pub fn new(storage_dir: &Path) -> Result<Self> {
        let settings_file = storage_dir.join(SETTINGS_FILE);
        let settings = Self::load_from_file(&settings_file)?;

        Ok(Self {
            settings_file,
            settings,
        })
    }

    fn load_from_file(path: &Path) -> Result<PoolSettings> {
        if !path.exists() {
            debug!("No settings file found, using defaults");
            return Ok(PoolSettings::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let settings: PoolSettings = serde_json::from_str(&contents)?;
        settings.validate()?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Re-read the file, e.g. after another process changed it
    pub fn reload(&mut self) -> Result<&PoolSettings> {
        self.settings = Self::load_from_file(&self.settings_file)?;
        Ok(&self.settings)
    }

    pub fn get(&self) -> &PoolSettings {
        &self.settings
    }

    /// Validate, replace and save
    pub async fn update(&mut self, settings: PoolSettings) -> Result<()> {
        settings.validate()?;
        self.settings = settings;
        self.save().await
    }

    pub async fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.settings)?;

        let temp_path = self.settings_file.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, &self.settings_file).await?;

        debug!("Saved settings to {:?}", self.settings_file);
        Ok(())
    }

    /// Back to defaults; removes the settings file
    pub async fn reset(&mut self) -> Result<()> {
        self.settings = PoolSettings::default();

        if self.settings_file.exists() {
            tokio::fs::remove_file(&self.settings_file).await?;
        }

        Ok(())
    }
}
