use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::credential::{Credential, CredentialStatus};

/// Display row for one key, as shown on an operator dashboard
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `None` for the fallback key
    pub id: Option<Uuid>,
    pub label: String,
    pub provider: String,
    pub hint: String,
    pub status: CredentialStatus,
    pub is_available: bool,
    pub is_fallback: bool,
    pub priority: u32,
    pub error_count: u32,
    pub total_requests: u64,
    pub last_latency_ms: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// `None` when unlimited
    pub rpm_limit: Option<u32>,
    pub requests_this_minute: u64,
    pub tokens_used_today: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub(crate) fn pooled(credential: &Credential, requests_this_minute: u64, now: DateTime<Utc>) -> Self {
        let under_limit = requests_this_minute < u64::from(credential.rpm_limit);
        let tokens_used_today = if credential.tokens_reset_date == Some(now.date_naive()) {
            credential.tokens_used_today
        } else {
            0
        };

        Self {
            id: Some(credential.id),
            label: credential.label.clone(),
            provider: credential.provider.clone(),
            hint: credential.hint.clone(),
            status: credential.status,
            is_available: credential.is_selectable(now) && under_limit,
            is_fallback: false,
            priority: credential.priority,
            error_count: credential.error_count,
            total_requests: credential.total_requests,
            last_latency_ms: credential.last_latency_ms,
            last_success_at: credential.last_success_at,
            last_error: credential.last_error.clone(),
            rpm_limit: Some(credential.rpm_limit),
            requests_this_minute,
            tokens_used_today,
            cooldown_until: credential.cooldown_until.filter(|until| *until > now),
        }
    }

    pub(crate) fn fallback(hint: String, env_var: &str) -> Self {
        Self {
            id: None,
            label: format!("Fallback ({})", env_var),
            provider: "env".to_string(),
            hint,
            status: CredentialStatus::Active,
            is_available: true,
            is_fallback: true,
            priority: u32::MAX,
            error_count: 0,
            total_requests: 0,
            last_latency_ms: 0,
            last_success_at: None,
            last_error: None,
            rpm_limit: None,
            requests_this_minute: 0,
            tokens_used_today: 0,
            cooldown_until: None,
        }
    }
}
