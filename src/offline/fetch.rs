//! Request wrapper that sends live when it can and queues when it cannot.

use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{
  ApiError, ApiRequest, ApiResponse, Dataset, Method, Mutation, RemoteApi, ValidationError,
};
use crate::cache::{CacheError, CacheManager, DatasetRead};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::event::{EventBus, SyncEvent};

use super::queue::{OfflineQueue, QueueError};

/// Error type for wrapped requests.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  /// The server answered with an error status. Never queued.
  #[error("request rejected with status {}", .0.status)]
  Rejected(ApiResponse),

  /// A read with no offline fallback could not reach the server.
  #[error("network unavailable: {0}")]
  Unavailable(ApiError),

  /// A write could not reach the server and could not be queued either.
  #[error("request was not queued: {0}")]
  NotQueued(#[source] QueueError),

  #[error("invalid request: {0}")]
  Invalid(#[from] ValidationError),

  /// The transport refused to build the request.
  #[error("request could not be sent: {0}")]
  Transport(ApiError),

  #[error("cache error: {0}")]
  Cache(#[from] CacheError),
}

/// Receipt for a write deferred to the offline queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedReceipt {
  pub id: Uuid,
  pub fingerprint: String,
  /// Queue length including this request.
  pub pending: usize,
}

/// What a wrapped request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
  /// The server answered successfully.
  Response(ApiResponse),
  /// Write accepted for later replay; render it as pending.
  Queued(QueuedReceipt),
  /// Read answered from the dataset cache.
  Cached(DatasetRead),
}

impl FetchOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, FetchOutcome::Queued(_))
  }
}

/// Front door for every API call the UI makes.
///
/// Writes go straight to the server while online with an empty queue;
/// otherwise they join the queue behind earlier writes so replay order
/// matches the order the user acted in. Reads are never queued: when the
/// network is gone they are answered from the dataset cache if the path is
/// a known dataset, and fail with [`FetchError::Unavailable`] otherwise.
#[derive(Clone)]
pub struct OfflineFetch {
  api: Arc<dyn RemoteApi>,
  queue: Arc<OfflineQueue>,
  cache: Arc<CacheManager>,
  monitor: ConnectivityMonitor,
  events: EventBus,
}

impl OfflineFetch {
  pub fn new(
    api: Arc<dyn RemoteApi>,
    queue: Arc<OfflineQueue>,
    cache: Arc<CacheManager>,
    monitor: ConnectivityMonitor,
    events: EventBus,
  ) -> Self {
    Self {
      api,
      queue,
      cache,
      monitor,
      events,
    }
  }

  /// Perform `method path` with an optional JSON body.
  pub async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> Result<FetchOutcome, FetchError> {
    let request = ApiRequest::new(method, path, body)?;
    if request.method.is_read() {
      self.read(request).await
    } else {
      self.write(request).await
    }
  }

  /// Validate and perform a typed mutation.
  pub async fn mutate(&self, mutation: &Mutation) -> Result<FetchOutcome, FetchError> {
    let request = mutation.to_request()?;
    tracing::debug!(mutation = mutation.name(), "submitting mutation");
    self.write(request).await
  }

  async fn write(&self, request: ApiRequest) -> Result<FetchOutcome, FetchError> {
    if self.monitor.current() != Connectivity::Online || !self.queue.is_empty() {
      return self.enqueue(request);
    }

    match self.api.send(&request).await {
      Ok(response) if response.status < 400 => Ok(FetchOutcome::Response(response)),
      Ok(response) => Err(FetchError::Rejected(response)),
      Err(e) if e.is_network() => {
        tracing::info!(path = %request.path, error = %e, "write failed to reach server, queueing");
        self.monitor.report_network_failure();
        self.enqueue(request)
      }
      Err(e) => Err(FetchError::Transport(e)),
    }
  }

  async fn read(&self, request: ApiRequest) -> Result<FetchOutcome, FetchError> {
    let dataset = Dataset::from_path(&request.path);

    if self.monitor.is_offline() {
      return match dataset {
        Some(d) => Ok(FetchOutcome::Cached(self.cache.cached(d)?)),
        None => Err(FetchError::Unavailable(ApiError::Network(
          "client is offline".to_string(),
        ))),
      };
    }

    match self.api.send(&request).await {
      Ok(response) if response.is_success() => {
        if let Some(d) = dataset {
          if let Err(e) = self.cache.store_snapshot(d, response.body.clone()) {
            tracing::warn!(dataset = %d, error = %e, "failed to cache read-through result");
          }
        }
        Ok(FetchOutcome::Response(response))
      }
      // Same rule as CacheManager::get: a dataset read never fails on status
      Ok(response) => match dataset {
        Some(d) => {
          tracing::warn!(dataset = %d, status = response.status, "dataset read failed, serving cache");
          Ok(FetchOutcome::Cached(self.cache.cached(d)?))
        }
        None if response.status < 400 => Ok(FetchOutcome::Response(response)),
        None => Err(FetchError::Rejected(response)),
      },
      Err(e) if e.is_network() => {
        self.monitor.report_network_failure();
        match dataset {
          Some(d) => Ok(FetchOutcome::Cached(self.cache.cached(d)?)),
          None => Err(FetchError::Unavailable(e)),
        }
      }
      Err(e) => Err(FetchError::Transport(e)),
    }
  }

  fn enqueue(&self, request: ApiRequest) -> Result<FetchOutcome, FetchError> {
    let fingerprint = request.fingerprint();
    let method = request.method;
    let path = request.path.clone();

    let id = self.queue.enqueue(request).map_err(FetchError::NotQueued)?;
    let pending = self.queue.count();

    self.events.emit(SyncEvent::Queued {
      id,
      method,
      path,
      pending,
    });

    Ok(FetchOutcome::Queued(QueuedReceipt {
      id,
      fingerprint,
      pending,
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::config::CacheConfig;
  use crate::storage::MemoryStore;
  use crate::test_support::ScriptedApi;
  use chrono::Utc;
  use serde_json::json;

  struct Fixture {
    api: Arc<ScriptedApi>,
    store: Arc<MemoryStore>,
    queue: Arc<OfflineQueue>,
    monitor: ConnectivityMonitor,
    fetch: OfflineFetch,
  }

  fn fixture(online: bool) -> Fixture {
    let api = Arc::new(ScriptedApi::new());
    let store = Arc::new(MemoryStore::new());
    let monitor = ConnectivityMonitor::new(online);
    let queue = Arc::new(OfflineQueue::open(store.clone()).unwrap());
    let cache = Arc::new(CacheManager::new(
      api.clone(),
      store.clone(),
      monitor.clone(),
      &CacheConfig::default(),
    ));
    let fetch = OfflineFetch::new(
      api.clone(),
      queue.clone(),
      cache,
      monitor.clone(),
      EventBus::default(),
    );
    Fixture {
      api,
      store,
      queue,
      monitor,
      fetch,
    }
  }

  fn start_duty() -> Mutation {
    Mutation::StartDuty {
      session_id: "sess-1".into(),
      staff_id: "staff-1".into(),
      theatre_id: "th-1".into(),
      role: None,
      started_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn test_online_write_goes_direct() {
    let f = fixture(true);
    f.api.reply_status("/api/duty-logs", 201, json!({ "id": "duty-1" }));

    let outcome = f.fetch.mutate(&start_duty()).await.unwrap();

    assert_eq!(
      outcome,
      FetchOutcome::Response(ApiResponse::new(201, json!({ "id": "duty-1" })))
    );
    assert_eq!(f.queue.count(), 0);
  }

  #[tokio::test]
  async fn test_offline_write_is_queued_without_network() {
    let f = fixture(false);

    let outcome = f.fetch.mutate(&start_duty()).await.unwrap();

    let receipt = match outcome {
      FetchOutcome::Queued(receipt) => receipt,
      other => panic!("expected queued outcome, got {:?}", other),
    };
    assert_eq!(receipt.pending, 1);
    assert_eq!(f.api.call_count(), 0);
    assert_eq!(f.queue.list().unwrap()[0].fingerprint, receipt.fingerprint);
  }

  #[tokio::test]
  async fn test_network_failure_queues_and_goes_offline() {
    let f = fixture(true);
    f.api.reply_network_error("/api/cleaning-logs");

    let outcome = f
      .fetch
      .request(Method::Post, "/api/cleaning-logs", Some(json!({ "theatreId": "th-1" })))
      .await
      .unwrap();

    assert!(outcome.is_queued());
    assert_eq!(f.queue.count(), 1);
    assert!(f.monitor.is_offline());
  }

  #[tokio::test]
  async fn test_application_error_is_surfaced_not_queued() {
    let f = fixture(true);
    f.api
      .reply_status("/api/duty-logs", 400, json!({ "error": "staff already on duty" }));

    let err = f.fetch.mutate(&start_duty()).await.unwrap_err();

    match err {
      FetchError::Rejected(response) => {
        assert_eq!(response.status, 400);
        assert_eq!(response.error_message(), Some("staff already on duty"));
      }
      other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(f.queue.count(), 0);
    assert!(!f.monitor.is_offline());
  }

  #[tokio::test]
  async fn test_server_error_is_surfaced_not_queued() {
    let f = fixture(true);
    f.api.reply_status("/api/duty-logs", 500, Value::Null);

    assert!(matches!(
      f.fetch.mutate(&start_duty()).await,
      Err(FetchError::Rejected(_))
    ));
    assert_eq!(f.queue.count(), 0);
  }

  #[tokio::test]
  async fn test_writes_queue_behind_pending_items_even_when_online() {
    let f = fixture(false);
    f.fetch.mutate(&start_duty()).await.unwrap();

    f.monitor.set_network_status(true);
    f.monitor.drain_finished();
    assert_eq!(f.monitor.current(), Connectivity::Online);

    let end = Mutation::EndDuty {
      session_id: "sess-1".into(),
      ended_at: Utc::now(),
    };
    assert!(f.fetch.mutate(&end).await.unwrap().is_queued());
    assert_eq!(f.api.call_count(), 0);

    let paths: Vec<String> = f
      .queue
      .list()
      .unwrap()
      .into_iter()
      .map(|i| i.request.path)
      .collect();
    assert_eq!(paths, vec!["/api/duty-logs", "/api/duty-logs/sess-1/end"]);
  }

  #[tokio::test]
  async fn test_storage_failure_reported_loudly() {
    let f = fixture(false);
    f.store.set_fail_writes(true);

    let err = f.fetch.mutate(&start_duty()).await.unwrap_err();
    assert!(matches!(err, FetchError::NotQueued(_)));
    assert_eq!(f.queue.count(), 0);
  }

  #[tokio::test]
  async fn test_invalid_mutation_never_leaves_the_client() {
    let f = fixture(true);
    let bad = Mutation::EndDuty {
      session_id: String::new(),
      ended_at: Utc::now(),
    };

    assert!(matches!(
      f.fetch.mutate(&bad).await,
      Err(FetchError::Invalid(ValidationError::EmptyField("session_id")))
    ));
    assert_eq!(f.api.call_count(), 0);
  }

  #[tokio::test]
  async fn test_reads_are_never_queued() {
    let f = fixture(false);

    let outcome = f.fetch.request(Method::Get, "/api/theatres", None).await.unwrap();
    assert_eq!(
      outcome,
      FetchOutcome::Cached(DatasetRead::Missing(Dataset::Theatres))
    );

    let err = f
      .fetch
      .request(Method::Get, "/api/patients/p-1", None)
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Unavailable(_)));
    assert_eq!(f.queue.count(), 0);
  }

  #[tokio::test]
  async fn test_read_falls_back_to_cache_on_network_failure() {
    let f = fixture(true);
    f.api.reply_status("/api/theatres", 200, json!([{ "id": "th-1", "name": "T1" }]));
    f.fetch.request(Method::Get, "/api/theatres", None).await.unwrap();

    f.api.reply_network_error("/api/theatres");
    let outcome = f.fetch.request(Method::Get, "/api/theatres", None).await.unwrap();

    let read = match outcome {
      FetchOutcome::Cached(read) => read,
      other => panic!("expected cached read, got {:?}", other),
    };
    assert_eq!(read.source(), CacheSource::CacheFresh);
    assert_eq!(read.payload().unwrap()[0]["id"], "th-1");
  }

  #[tokio::test]
  async fn test_dataset_read_server_error_serves_cache() {
    let f = fixture(true);
    f.api.reply_status("/api/theatres", 200, json!([{ "id": "th-1", "name": "T1" }]));
    f.fetch.request(Method::Get, "/api/theatres", None).await.unwrap();

    f.api.reply_status("/api/theatres", 503, json!({ "error": "maintenance" }));
    let outcome = f.fetch.request(Method::Get, "/api/theatres", None).await.unwrap();

    match outcome {
      FetchOutcome::Cached(read) => assert_eq!(read.payload().unwrap()[0]["id"], "th-1"),
      other => panic!("expected cached read, got {:?}", other),
    }
    // A server error is still a response, connectivity is untouched
    assert_eq!(f.monitor.current(), Connectivity::Online);

    // Non-dataset reads still surface the error
    f.api.reply_status("/api/patients/p-1", 503, json!({}));
    let err = f
      .fetch
      .request(Method::Get, "/api/patients/p-1", None)
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Rejected(r) if r.status == 503));
  }
}
