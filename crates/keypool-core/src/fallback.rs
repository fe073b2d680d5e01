//! Static fallback key, read once at startup

use tracing::{info, warn};

use crate::crypto::SecretString;

/// Key used when no pooled key is available. It bypasses rate windows and
/// the health state machine.
#[derive(Debug, Clone)]
pub struct FallbackCredential {
    secret: SecretString,
}

impl FallbackCredential {
    /// `None` for an empty or whitespace-only value
    pub fn new(secret: &str) -> Option<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            return None;
        }
        Some(Self {
            secret: SecretString::new(secret.to_string()),
        })
    }

    /// Read `var` from the process environment
    pub fn from_env(var: &str) -> Option<Self> {
        match std::env::var(var).ok().and_then(|value| Self::new(&value)) {
            Some(fallback) => {
                info!("Fallback key ...{} loaded from {}", fallback.hint(), var);
                Some(fallback)
            }
            None => {
                warn!("No fallback key in {}", var);
                None
            }
        }
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn hint(&self) -> String {
        self.secret.hint()
    }
}
