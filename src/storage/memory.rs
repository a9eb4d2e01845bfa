//! In-memory [`KvStore`], used by tests and `--ephemeral` runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{KvStore, StorageError, StorageResult};

/// Record store that lives only as long as the process.
///
/// Writes can be made to fail on demand so callers can exercise their
/// storage-error paths.
#[derive(Default)]
pub struct MemoryStore {
  records: Mutex<BTreeMap<String, Vec<u8>>>,
  fail_writes: Mutex<bool>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent `put`/`delete` fail until turned off again.
  pub fn set_fail_writes(&self, fail: bool) {
    if let Ok(mut flag) = self.fail_writes.lock() {
      *flag = fail;
    }
  }

  fn records(&self) -> StorageResult<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self
      .records
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }

  fn check_writable(&self) -> StorageResult<()> {
    let failing = self
      .fail_writes
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
    if *failing {
      return Err(StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "write rejected by memory store",
      )));
    }
    Ok(())
  }
}

impl KvStore for MemoryStore {
  fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    self.check_writable()?;
    self.records()?.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    Ok(self.records()?.get(key).cloned())
  }

  fn delete(&self, key: &str) -> StorageResult<()> {
    self.check_writable()?;
    self.records()?.remove(key);
    Ok(())
  }

  fn list_all(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
    Ok(
      self
        .records()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_list_all_is_ordered_and_scoped() {
    let store = MemoryStore::new();
    store.put("queue/b", b"2").unwrap();
    store.put("queue/a", b"1").unwrap();
    store.put("queuex", b"other").unwrap();

    let entries = store.list_all("queue/").unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, "queue/a");
    assert_eq!(entries[1].0, "queue/b");
  }

  #[test]
  fn test_failing_writes_leave_contents_untouched() {
    let store = MemoryStore::new();
    store.put("k", b"v").unwrap();

    store.set_fail_writes(true);
    assert!(store.put("k", b"new").is_err());
    assert!(store.delete("k").is_err());

    store.set_fail_writes(false);
    assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
  }
}
