use uuid::Uuid;

use crate::credential::Credential;
use crate::crypto::SecretString;

/// Where a leased key came from
#[derive(Debug, Clone)]
pub enum LeaseSource {
    /// A key from the managed pool, as it looked when selected
    Pooled(Credential),
    /// The static fallback key
    Fallback,
}

/// One selected key, ready for a downstream call. Hand it back to
/// `report_success` / `report_error` once the call finishes.
#[derive(Debug, Clone)]
pub struct Lease {
    source: LeaseSource,
    secret: SecretString,
}

impl Lease {
    pub(crate) fn pooled(credential: Credential, secret: SecretString) -> Self {
        Self {
            source: LeaseSource::Pooled(credential),
            secret,
        }
    }

    pub(crate) fn fallback(secret: SecretString) -> Self {
        Self {
            source: LeaseSource::Fallback,
            secret,
        }
    }

    pub fn source(&self) -> &LeaseSource {
        &self.source
    }

    /// The pooled credential, `None` for the fallback
    pub fn credential(&self) -> Option<&Credential> {
        match &self.source {
            LeaseSource::Pooled(credential) => Some(credential),
            LeaseSource::Fallback => None,
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        self.credential().map(|c| c.id)
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.source, LeaseSource::Fallback)
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn hint(&self) -> String {
        self.secret.hint()
    }
}
