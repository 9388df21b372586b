//! Persisted storage adapters and the credential store built on them.

mod credentials;
mod file_store;
mod memory_store;

pub use credentials::CredentialStore;
pub use file_store::FileKeyValueStore;
pub use memory_store::MemoryKeyValueStore;
