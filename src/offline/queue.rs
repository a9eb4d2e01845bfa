//! Offline queue for writes made while the API is unreachable.
//!
//! Each queued request is one record under `queue/<seq>`, where `seq` is a
//! zero-padded, monotonically increasing sequence number, so a prefix scan
//! returns requests in the order they were enqueued. Items the server
//! definitively rejected move to `dead/<seq>` and stay there until someone
//! discards or re-queues them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::api::{ApiRequest, ApiResponse};
use crate::storage::{KvStore, StorageError};

const QUEUE_PREFIX: &str = "queue/";
const DEAD_PREFIX: &str = "dead/";

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  /// The backing store failed; the operation did not take effect.
  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  /// A stored record could not be decoded.
  #[error("corrupt queue record {key}: {source}")]
  Corrupt {
    key: String,
    source: serde_json::Error,
  },

  #[error("no dead-lettered request with id {0}")]
  NotDeadLettered(Uuid),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// One deferred mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
  pub id: Uuid,
  /// Position in the queue; replay follows ascending `seq`.
  pub seq: u64,
  pub request: ApiRequest,
  pub fingerprint: String,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub last_error: Option<String>,
}

/// Why a request was abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeadLetterReason {
  /// The server answered with a 4xx.
  Rejected {
    status: u16,
    message: Option<String>,
    body: Value,
  },
  /// Too many transient failures.
  Exhausted { attempts: u32, last_error: String },
  /// The stored request can no longer be sent at all.
  Invalid { error: String },
}

impl DeadLetterReason {
  pub fn rejected(response: &ApiResponse) -> Self {
    DeadLetterReason::Rejected {
      status: response.status,
      message: response.error_message().map(String::from),
      body: response.body.clone(),
    }
  }
}

/// A request kept for manual inspection after being abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub item: QueuedRequest,
  #[serde(flatten)]
  pub reason: DeadLetterReason,
  pub dead_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueIndex {
  next_seq: u64,
  active: HashMap<Uuid, u64>,
  dead: HashMap<Uuid, u64>,
}

impl QueueIndex {
  fn allocate_seq(&mut self) -> u64 {
    let seq = self.next_seq;
    self.next_seq += 1;
    seq
  }
}

/// Durable FIFO of pending mutations plus the dead-letter list.
///
/// Counts are served from an in-memory index rebuilt on open, so `count()`
/// never touches storage.
pub struct OfflineQueue {
  store: Arc<dyn KvStore>,
  index: Mutex<QueueIndex>,
}

impl OfflineQueue {
  /// Open the queue over `store`, indexing whatever it already holds.
  pub fn open(store: Arc<dyn KvStore>) -> QueueResult<Self> {
    let mut index = QueueIndex::default();
    let mut max_seq = None;

    for item in load::<QueuedRequest>(store.as_ref(), QUEUE_PREFIX)? {
      max_seq = max_seq.max(Some(item.seq));
      index.active.insert(item.id, item.seq);
    }
    for letter in load::<DeadLetter>(store.as_ref(), DEAD_PREFIX)? {
      max_seq = max_seq.max(Some(letter.item.seq));
      index.dead.insert(letter.item.id, letter.item.seq);
    }
    index.next_seq = max_seq.map_or(0, |s| s + 1);

    if !index.active.is_empty() || !index.dead.is_empty() {
      tracing::info!(
        pending = index.active.len(),
        dead = index.dead.len(),
        "loaded offline queue"
      );
    }

    Ok(Self {
      store,
      index: Mutex::new(index),
    })
  }

  /// Append `request` to the queue and return its id.
  ///
  /// The request is persisted before this returns; a storage failure is
  /// returned as an error and nothing is queued.
  pub fn enqueue(&self, request: ApiRequest) -> QueueResult<Uuid> {
    let mut index = self.index()?;

    let item = QueuedRequest {
      id: Uuid::new_v4(),
      seq: index.next_seq,
      fingerprint: request.fingerprint(),
      request,
      created_at: Utc::now(),
      retry_count: 0,
      last_error: None,
    };

    self.write(&queue_key(item.seq), &item)?;
    index.allocate_seq();
    index.active.insert(item.id, item.seq);

    tracing::debug!(
      id = %item.id,
      method = %item.request.method,
      path = %item.request.path,
      fingerprint = %item.fingerprint,
      "queued request"
    );
    Ok(item.id)
  }

  /// Queued requests, oldest first.
  pub fn list(&self) -> QueueResult<Vec<QueuedRequest>> {
    load(self.store.as_ref(), QUEUE_PREFIX)
  }

  /// Look up one queued request.
  pub fn get(&self, id: Uuid) -> QueueResult<Option<QueuedRequest>> {
    let Some(seq) = self.index()?.active.get(&id).copied() else {
      return Ok(None);
    };
    read(self.store.as_ref(), &queue_key(seq))
  }

  /// Drop a request from the queue. Removing an unknown id is a no-op.
  pub fn remove(&self, id: Uuid) -> QueueResult<()> {
    let mut index = self.index()?;
    if let Some(seq) = index.active.get(&id).copied() {
      self.store.delete(&queue_key(seq))?;
      index.active.remove(&id);
    }
    Ok(())
  }

  /// Number of queued requests.
  pub fn count(&self) -> usize {
    match self.index() {
      Ok(index) => index.active.len(),
      Err(e) => {
        tracing::error!(error = %e, "queue index unavailable, reporting no pending requests");
        0
      }
    }
  }

  pub fn is_empty(&self) -> bool {
    self.count() == 0
  }

  /// Record a failed replay attempt and return the new retry count.
  pub fn record_failure(&self, id: Uuid, error: &str) -> QueueResult<Option<u32>> {
    let index = self.index()?;
    let Some(seq) = index.active.get(&id).copied() else {
      return Ok(None);
    };
    let key = queue_key(seq);
    let Some(mut item) = read::<QueuedRequest>(self.store.as_ref(), &key)? else {
      return Ok(None);
    };

    item.retry_count += 1;
    item.last_error = Some(error.to_string());
    self.write(&key, &item)?;

    Ok(Some(item.retry_count))
  }

  /// Move a request to the dead-letter list.
  ///
  /// The dead letter is written before the active entry is deleted, so a
  /// crash in between leaves a duplicate rather than losing the request.
  pub fn dead_letter(&self, id: Uuid, reason: DeadLetterReason) -> QueueResult<Option<DeadLetter>> {
    let mut index = self.index()?;
    let Some(seq) = index.active.get(&id).copied() else {
      return Ok(None);
    };
    let Some(item) = read::<QueuedRequest>(self.store.as_ref(), &queue_key(seq))? else {
      index.active.remove(&id);
      return Ok(None);
    };

    let letter = DeadLetter {
      item,
      reason,
      dead_at: Utc::now(),
    };
    self.write(&dead_key(seq), &letter)?;
    self.store.delete(&queue_key(seq))?;
    index.active.remove(&id);
    index.dead.insert(id, seq);

    tracing::warn!(
      id = %id,
      method = %letter.item.request.method,
      path = %letter.item.request.path,
      reason = ?letter.reason,
      "request dead-lettered"
    );
    Ok(Some(letter))
  }

  /// Dead-lettered requests, oldest first.
  pub fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
    load(self.store.as_ref(), DEAD_PREFIX)
  }

  pub fn dead_letter_count(&self) -> usize {
    match self.index() {
      Ok(index) => index.dead.len(),
      Err(e) => {
        tracing::error!(error = %e, "queue index unavailable, reporting no dead letters");
        0
      }
    }
  }

  /// Permanently delete a dead letter. Unknown ids are a no-op.
  pub fn discard_dead_letter(&self, id: Uuid) -> QueueResult<()> {
    let mut index = self.index()?;
    if let Some(seq) = index.dead.get(&id).copied() {
      self.store.delete(&dead_key(seq))?;
      index.dead.remove(&id);
    }
    Ok(())
  }

  /// Put a dead letter back at the tail of the queue with a fresh retry count.
  pub fn requeue_dead_letter(&self, id: Uuid) -> QueueResult<()> {
    let mut index = self.index()?;
    let seq = index
      .dead
      .get(&id)
      .copied()
      .ok_or(QueueError::NotDeadLettered(id))?;
    let letter = read::<DeadLetter>(self.store.as_ref(), &dead_key(seq))?
      .ok_or(QueueError::NotDeadLettered(id))?;

    let item = QueuedRequest {
      seq: index.next_seq,
      retry_count: 0,
      last_error: None,
      ..letter.item
    };
    self.write(&queue_key(item.seq), &item)?;
    index.allocate_seq();
    self.store.delete(&dead_key(seq))?;
    index.dead.remove(&id);
    index.active.insert(id, item.seq);

    tracing::info!(id = %id, "dead letter re-queued");
    Ok(())
  }

  fn write<T: Serialize>(&self, key: &str, value: &T) -> QueueResult<()> {
    let bytes = serde_json::to_vec(value).map_err(StorageError::from)?;
    self.store.put(key, &bytes).map_err(|e| {
      tracing::error!(key, error = %e, "failed to persist queue record");
      QueueError::from(e)
    })
  }

  fn index(&self) -> QueueResult<MutexGuard<'_, QueueIndex>> {
    self
      .index
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()).into())
  }
}

fn queue_key(seq: u64) -> String {
  format!("{}{:020}", QUEUE_PREFIX, seq)
}

fn dead_key(seq: u64) -> String {
  format!("{}{:020}", DEAD_PREFIX, seq)
}

fn read<T: for<'de> Deserialize<'de>>(store: &dyn KvStore, key: &str) -> QueueResult<Option<T>> {
  match store.get(key)? {
    Some(bytes) => decode(key, &bytes).map(Some),
    None => Ok(None),
  }
}

fn load<T: for<'de> Deserialize<'de>>(store: &dyn KvStore, prefix: &str) -> QueueResult<Vec<T>> {
  store
    .list_all(prefix)?
    .into_iter()
    .map(|(key, bytes)| decode(&key, &bytes))
    .collect()
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, bytes: &[u8]) -> QueueResult<T> {
  serde_json::from_slice(bytes).map_err(|source| QueueError::Corrupt {
    key: key.to_string(),
    source,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::Method;
  use crate::storage::{MemoryStore, SqliteStore};
  use serde_json::json;

  fn post(n: u32) -> ApiRequest {
    ApiRequest::new(Method::Post, "/api/cleaning-logs", Some(json!({ "n": n }))).unwrap()
  }

  fn memory_queue() -> (Arc<MemoryStore>, OfflineQueue) {
    let store = Arc::new(MemoryStore::new());
    let queue = OfflineQueue::open(store.clone()).unwrap();
    (store, queue)
  }

  #[test]
  fn test_enqueue_and_list_in_order() {
    let (_, queue) = memory_queue();
    assert!(queue.is_empty());

    let ids: Vec<Uuid> = (0..12).map(|n| queue.enqueue(post(n)).unwrap()).collect();

    let items = queue.list().unwrap();
    assert_eq!(items.len(), 12);
    assert_eq!(queue.count(), items.len());
    for (n, item) in items.iter().enumerate() {
      assert_eq!(item.id, ids[n]);
      assert_eq!(item.request.body, Some(json!({ "n": n })));
      assert_eq!(item.retry_count, 0);
      assert_eq!(item.fingerprint, item.request.fingerprint());
    }
  }

  #[test]
  fn test_count_tracks_list_through_removals() {
    let (_, queue) = memory_queue();
    let a = queue.enqueue(post(1)).unwrap();
    let b = queue.enqueue(post(2)).unwrap();
    let c = queue.enqueue(post(3)).unwrap();

    queue.remove(b).unwrap();
    assert_eq!(queue.count(), queue.list().unwrap().len());
    assert_eq!(
      queue.list().unwrap().iter().map(|i| i.id).collect::<Vec<_>>(),
      vec![a, c]
    );
  }

  #[test]
  fn test_remove_is_idempotent() {
    let (_, queue) = memory_queue();
    let id = queue.enqueue(post(1)).unwrap();
    queue.enqueue(post(2)).unwrap();

    queue.remove(id).unwrap();
    queue.remove(id).unwrap();
    queue.remove(Uuid::new_v4()).unwrap();

    assert_eq!(queue.count(), 1);
  }

  #[test]
  fn test_storage_failure_is_reported_and_nothing_queued() {
    let (store, queue) = memory_queue();
    store.set_fail_writes(true);

    let err = queue.enqueue(post(1)).unwrap_err();
    assert!(matches!(err, QueueError::Storage(_)));
    assert_eq!(queue.count(), 0);

    store.set_fail_writes(false);
    queue.enqueue(post(2)).unwrap();
    assert_eq!(queue.list().unwrap()[0].seq, 0);
  }

  #[test]
  fn test_record_failure_increments_retry_count() {
    let (_, queue) = memory_queue();
    let id = queue.enqueue(post(1)).unwrap();

    assert_eq!(queue.record_failure(id, "timeout").unwrap(), Some(1));
    assert_eq!(queue.record_failure(id, "refused").unwrap(), Some(2));

    let item = queue.get(id).unwrap().unwrap();
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.last_error.as_deref(), Some("refused"));
    assert_eq!(queue.record_failure(Uuid::new_v4(), "x").unwrap(), None);
  }

  #[test]
  fn test_dead_letter_and_requeue() {
    let (_, queue) = memory_queue();
    let first = queue.enqueue(post(1)).unwrap();
    let second = queue.enqueue(post(2)).unwrap();

    let response = ApiResponse::new(400, json!({ "error": "theatre closed" }));
    let letter = queue
      .dead_letter(first, DeadLetterReason::rejected(&response))
      .unwrap()
      .unwrap();
    assert!(matches!(
      letter.reason,
      DeadLetterReason::Rejected { status: 400, .. }
    ));

    assert_eq!(queue.count(), 1);
    assert_eq!(queue.dead_letter_count(), 1);
    assert_eq!(queue.dead_letters().unwrap()[0].item.id, first);

    // Re-queued item goes behind what is already pending
    queue.requeue_dead_letter(first).unwrap();
    let order: Vec<Uuid> = queue.list().unwrap().iter().map(|i| i.id).collect();
    assert_eq!(order, vec![second, first]);
    assert_eq!(queue.get(first).unwrap().unwrap().retry_count, 0);
    assert_eq!(queue.dead_letter_count(), 0);

    assert!(matches!(
      queue.requeue_dead_letter(first),
      Err(QueueError::NotDeadLettered(_))
    ));
  }

  #[test]
  fn test_discard_dead_letter_is_idempotent() {
    let (_, queue) = memory_queue();
    let id = queue.enqueue(post(1)).unwrap();
    queue
      .dead_letter(
        id,
        DeadLetterReason::Invalid {
          error: "bad path".into(),
        },
      )
      .unwrap();

    queue.discard_dead_letter(id).unwrap();
    queue.discard_dead_letter(id).unwrap();
    assert!(queue.dead_letters().unwrap().is_empty());
  }

  #[test]
  fn test_poisoned_index_fails_writes_loudly() {
    let (_, queue) = memory_queue();
    queue.enqueue(post(1)).unwrap();

    std::thread::scope(|s| {
      let _ = s
        .spawn(|| {
          let _guard = queue.index.lock().unwrap();
          panic!("poison the index");
        })
        .join();
    });

    assert_eq!(queue.count(), 0);
    assert_eq!(queue.dead_letter_count(), 0);
    assert!(matches!(
      queue.enqueue(post(2)),
      Err(QueueError::Storage(StorageError::LockPoisoned(_)))
    ));
  }

  #[test]
  fn test_reopen_preserves_order_and_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    let (a, b) = {
      let queue = OfflineQueue::open(Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
      let a = queue.enqueue(post(1)).unwrap();
      let b = queue.enqueue(post(2)).unwrap();
      queue
        .dead_letter(
          a,
          DeadLetterReason::Exhausted {
            attempts: 6,
            last_error: "timeout".into(),
          },
        )
        .unwrap();
      (a, b)
    };

    let queue = OfflineQueue::open(Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
    assert_eq!(queue.count(), 1);
    assert_eq!(queue.dead_letter_count(), 1);

    let c = queue.enqueue(post(3)).unwrap();
    let items = queue.list().unwrap();
    assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![b, c]);
    assert_eq!(items[1].seq, 2);
    assert_eq!(queue.dead_letters().unwrap()[0].item.id, a);
  }
}
