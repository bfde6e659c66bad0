//! Pluggable persistence behind the authoritative store.
//!
//! The store never talks to a database directly; it opens one
//! [`PrefStorage`] handle per namespace through an injected
//! [`StorageFactory`] and drives it with plain get/put/remove/clear/
//! enumerate calls over `(key, type-tag, wire-string)` rows.
//!
//! Two implementations ship here:
//! - [`MemoryStorage`] — ephemeral tables for tests and in-memory
//!   servers
//! - [`RocksStorage`] — durable rows in RocksDB
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod memory;
pub mod rocks;

pub use memory::{MemoryFactory, MemoryStorage};
pub use rocks::{RocksConfig, RocksFactory, RocksStorage};

use prefsync_core::PrefType;

/// Per-namespace persistent key-value store.
///
/// The store serializes all calls under its own lock, so implementors
/// need `Send` but not internal synchronization.
pub trait PrefStorage: Send {
    fn get(&self, key: &str) -> Result<Option<(PrefType, String)>, StorageError>;

    fn put(&mut self, key: &str, pref_type: PrefType, value: &str) -> Result<(), StorageError>;

    /// Returns whether the key was present.
    fn remove(&mut self, key: &str) -> Result<bool, StorageError>;

    fn clear(&mut self) -> Result<(), StorageError>;

    fn enumerate(&self) -> Result<Vec<(String, PrefType, String)>, StorageError>;
}

/// Opens one storage handle per namespace, lazily.
pub trait StorageFactory: Send + Sync {
    fn open(&self, namespace: &str) -> Result<Box<dyn PrefStorage>, StorageError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StorageError {
    DatabaseError(String),
    /// A stored row does not parse back into `(type, wire)`.
    CorruptEntry(String),
    IoError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StorageError::CorruptEntry(e) => write!(f, "Corrupt entry: {e}"),
            StorageError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}
