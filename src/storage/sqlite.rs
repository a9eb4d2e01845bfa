//! SQLite implementation of [`KvStore`].

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{KvStore, StorageError, StorageResult};

/// Schema for the record table.
const STORE_SCHEMA: &str = r#"
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed record store.
///
/// One connection guarded by a mutex; every write is its own implicit
/// transaction, so a single `put` replaces a value atomically.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  path: Option<PathBuf>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> StorageResult<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
      path: Some(path.to_path_buf()),
    };
    store.run_migrations()?;

    tracing::debug!(path = %path.display(), "opened offline store");
    Ok(store)
  }

  /// Open a throwaway in-memory database. Contents vanish on drop.
  pub fn open_in_memory() -> StorageResult<Self> {
    let store = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
      path: None,
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> StorageResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StorageError::NoDataDir)?;

    Ok(data_dir.join("theatre-sync").join("offline.db"))
  }

  /// Location of the database file, if it lives on disk.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  fn run_migrations(&self) -> StorageResult<()> {
    self.lock()?.execute_batch(STORE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }
}

impl KvStore for SqliteStore {
  fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    self.lock()?.execute(
      "INSERT OR REPLACE INTO records (key, value, written_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM records WHERE key = ?",
        params![key],
        |row| row.get::<_, Vec<u8>>(0),
      )
      .optional()?;
    Ok(value)
  }

  fn delete(&self, key: &str) -> StorageResult<()> {
    self
      .lock()?
      .execute("DELETE FROM records WHERE key = ?", params![key])?;
    Ok(())
  }

  fn list_all(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT key, value FROM records
       WHERE substr(key, 1, length(?1)) = ?1
       ORDER BY key",
    )?;

    let rows = stmt
      .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<Vec<(String, Vec<u8>)>, _>>()?;

    Ok(rows)
  }
}
