//! Key rotation: selection, outcome reporting and health views

mod classify;
mod health;
mod lease;
mod manager;

pub use classify::is_rate_limit_error;
pub use health::HealthReport;
pub use lease::{Lease, LeaseSource};
pub use manager::RotationManager;
