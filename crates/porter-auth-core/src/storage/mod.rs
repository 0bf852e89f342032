//! Durable key/value storage backing the credential store.
//!
//! The credential store only needs string values addressed by key, the same
//! shape as browser local storage. Backends:
//! - `MemoryStorage`: process memory only (tests, throwaway sessions)
//! - `FileStorage`: a JSON document on disk, optionally sealed with a passphrase
//! - `KeyringStorage`: one OS keychain entry per key

pub mod file;
pub mod keyring;
pub mod memory;
mod seal;

use thiserror::Error;

pub use self::file::FileStorage;
pub use self::keyring::KeyringStorage;
pub use self::memory::MemoryStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage document could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] ::keyring::Error),

    #[error("Sealed storage error: {0}")]
    Crypto(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persistence that survives a process restart.
///
/// Implementations are shared between threads; each call is a complete
/// read or write of one key.
pub trait DurableStorage: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;
}

impl<T: DurableStorage + ?Sized> DurableStorage for Box<T> {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        (**self).remove(key)
    }
}

impl<T: DurableStorage + ?Sized> DurableStorage for std::sync::Arc<T> {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        (**self).remove(key)
    }
}
