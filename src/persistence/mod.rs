//! The `persistence` module provides the storage interface the broker writes
//! its crash-recovery snapshot through.
//!
//! The broker never reaches for a process-wide handle: a [`Storage`]
//! implementation is injected at construction. `sled` backs the server
//! binary; [`MemoryStore`] serves tests and embedded use.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
}

/// Byte-oriented key/value store keyed by broker identifier.
///
/// Implementations must tolerate being called from the broker's sync timer
/// while other tasks run; a single writer per key is assumed.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
}
