//! Credential type definitions and the health state machine

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health status of a pooled key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Eligible for rotation
    #[default]
    Active,
    /// Rate limited; skipped until `cooldown_until`
    Cooldown,
    /// Too many consecutive failures; needs a manual reset
    Disabled,
    /// Flagged by an administrator
    Error,
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Cooldown => "cooldown",
            CredentialStatus::Disabled => "disabled",
            CredentialStatus::Error => "error",
        };
        f.pad(label)
    }
}

/// Outcome policy applied by [`Credential::mark_error`]
#[derive(Debug, Clone, Copy)]
pub struct ErrorPolicy {
    pub cooldown: Duration,
    pub disable_threshold: u32,
    pub message_limit: usize,
}

/// Pooled key metadata (safe to display)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub label: String,
    /// Provider name, e.g. "openai"
    pub provider: String,
    /// Last 4 characters of the key
    pub hint: String,
    pub status: CredentialStatus,
    /// Consecutive failures since the last success
    pub error_count: u32,
    pub total_requests: u64,
    pub last_latency_ms: u64,
    pub rpm_limit: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub tokens_used_today: u64,
    pub tokens_reset_date: Option<NaiveDate>,
    /// Lower values rotate first
    pub priority: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(label: &str, provider: &str, hint: String, priority: u32, rpm_limit: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            label: label.to_string(),
            provider: provider.to_string(),
            hint,
            status: CredentialStatus::Active,
            error_count: 0,
            total_requests: 0,
            last_latency_ms: 0,
            rpm_limit,
            cooldown_until: None,
            tokens_used_today: 0,
            tokens_reset_date: None,
            priority,
            last_error: None,
            last_error_at: None,
            last_success_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status and cooldown allow use at `now`. The per-minute window is
    /// checked separately against the rate counter.
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        let cooling = self.cooldown_until.map_or(false, |until| now < until);
        match self.status {
            CredentialStatus::Active => !cooling,
            // An elapsed cooldown returns the key to rotation.
            CredentialStatus::Cooldown => !cooling,
            CredentialStatus::Disabled | CredentialStatus::Error => false,
        }
    }

    /// Record a successful call
    pub fn mark_success(&mut self, latency_ms: u64, now: DateTime<Utc>) {
        self.roll_daily_usage(now);
        self.error_count = 0;
        self.last_latency_ms = latency_ms;
        self.total_requests += 1;
        self.last_success_at = Some(now);
        if self.status == CredentialStatus::Cooldown && self.is_selectable(now) {
            self.status = CredentialStatus::Active;
            self.cooldown_until = None;
        }
        self.updated_at = now;
    }

    /// Record a failed call. Rate limits always start a cooldown; reaching
    /// the threshold disables the key even if it is cooling down.
    pub fn mark_error(
        &mut self,
        message: &str,
        is_rate_limit: bool,
        policy: ErrorPolicy,
        now: DateTime<Utc>,
    ) {
        self.error_count = self.error_count.saturating_add(1);
        self.total_requests += 1;
        self.last_error = Some(message.chars().take(policy.message_limit).collect());
        self.last_error_at = Some(now);

        if is_rate_limit {
            self.status = CredentialStatus::Cooldown;
            self.cooldown_until = Some(
                now.checked_add_signed(policy.cooldown)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );
        }

        if self.error_count >= policy.disable_threshold {
            self.status = CredentialStatus::Disabled;
        }

        self.updated_at = now;
    }

    /// Add usage for the current UTC day
    pub fn add_tokens(&mut self, tokens: u64, now: DateTime<Utc>) {
        self.roll_daily_usage(now);
        self.tokens_used_today = self.tokens_used_today.saturating_add(tokens);
        self.updated_at = now;
    }

    /// Manual administrative reset: back to active with a clean error streak
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = CredentialStatus::Active;
        self.error_count = 0;
        self.cooldown_until = None;
        self.updated_at = now;
    }

    fn roll_daily_usage(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.tokens_reset_date != Some(today) {
            self.tokens_used_today = 0;
            self.tokens_reset_date = Some(today);
        }
    }
}

/// A credential as persisted: metadata plus the sealed key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub credential: Credential,
    /// `v1:nonce:ciphertext`, sealed with the credential id as associated data
    pub encrypted_value: String,
}

impl StoredCredential {
    pub fn id(&self) -> Uuid {
        self.credential.id
    }
}
