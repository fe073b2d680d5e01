//! Credential store backends
//!
//! - In-memory store for embedding and tests
//! - JSON file store shared by every process pointed at the same directory

mod file;
mod memory;
mod traits;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;
pub use traits::{CredentialChange, CredentialEdit, CredentialStore, ResealFn};
