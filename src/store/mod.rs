//! Versioned record storage.
//!
//! Every write in the engine is a read-modify-write: read a [`Versioned`]
//! record, validate against that snapshot, then [`Table::compare_and_swap`]
//! the new value conditionally on the version being unchanged. A stale
//! version yields [`StoreError::Conflict`] and the caller retries from the read.

use thiserror::Error;

mod memory;
pub use memory::MemoryTable;

/// Monotonic record version. The first committed version is 1.
pub type Version = u64;

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub version: Version,
    pub value: V,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("version conflict: expected {expected}, found {found}")]
    Conflict { expected: Version, found: Version },

    #[error("record already exists")]
    AlreadyExists,

    #[error("record not found")]
    NotFound,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Errors that go away when the whole read-modify-write is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::AlreadyExists | StoreError::Unavailable(_)
        )
    }
}

/// A keyed table of versioned records.
pub trait Table<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<Versioned<V>>, StoreError>;

    /// Create a record; fails with `AlreadyExists` if the key is taken.
    fn insert(&self, key: K, value: V) -> Result<Versioned<V>, StoreError>;

    /// Replace the record if its current version is `expected`.
    fn compare_and_swap(
        &self,
        key: &K,
        expected: Version,
        value: V,
    ) -> Result<Versioned<V>, StoreError>;

    /// Snapshot of every record, in no particular order.
    fn scan(&self) -> Result<Vec<Versioned<V>>, StoreError>;
}
