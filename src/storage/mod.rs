//! Durable key-value storage for the offline queue and dataset cache.
//!
//! Everything the sync core persists goes through [`KvStore`], a four-call
//! capability (`put`, `get`, `delete`, `list_all`). The SQLite backend is the
//! production store; [`MemoryStore`] keeps the same contract in memory and is
//! what the tests run against.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  /// SQLite error.
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  /// I/O error while preparing the store location.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// A stored record could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The store mutex was poisoned by a panicking writer.
  #[error("lock poisoned: {0}")]
  LockPoisoned(String),

  /// No usable data directory on this machine.
  #[error("could not determine data directory")]
  NoDataDir,
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Minimal record store used by the sync core.
///
/// Keys are plain strings; callers namespace them with a prefix such as
/// `queue/` or `cache/`. `list_all` returns entries in ascending key order,
/// which the queue relies on for FIFO replay.
pub trait KvStore: Send + Sync {
  /// Insert or replace the value stored under `key`.
  fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

  /// Fetch the value stored under `key`.
  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

  /// Delete `key`. Deleting a missing key is not an error.
  fn delete(&self, key: &str) -> StorageResult<()>;

  /// All entries whose key starts with `prefix`, ordered by key.
  fn list_all(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;
}

impl<S: KvStore + ?Sized> KvStore for std::sync::Arc<S> {
  fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    (**self).put(key, value)
  }

  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    (**self).get(key)
  }

  fn delete(&self, key: &str) -> StorageResult<()> {
    (**self).delete(key)
  }

  fn list_all(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
    (**self).list_all(prefix)
  }
}
