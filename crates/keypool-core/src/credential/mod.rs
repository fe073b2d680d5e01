//! Pooled API keys: metadata, health state machine and administration

mod admin;
mod types;

pub use admin::CredentialAdmin;
pub use types::*;
