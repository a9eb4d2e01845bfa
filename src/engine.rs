//! Lifecycle object tying the sync components together.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{ApiError, HttpApi, RemoteApi};
use crate::cache::CacheManager;
use crate::config::Config;
use crate::connectivity::{ConnectivityDetector, ConnectivityMonitor, NetworkProbe};
use crate::event::{EventBus, StatusSnapshot, SyncEvent};
use crate::offline::{OfflineFetch, OfflineQueue, QueueError, QueueProcessor};
use crate::storage::{KvStore, MemoryStore, SqliteStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("queue error: {0}")]
  Queue(#[from] QueueError),

  #[error("api client error: {0}")]
  Api(#[from] ApiError),
}

/// Owns every sync component and wires them to one connectivity monitor.
pub struct SyncEngine {
  config: Config,
  probe: Arc<dyn NetworkProbe>,
  monitor: ConnectivityMonitor,
  events: EventBus,
  queue: Arc<OfflineQueue>,
  cache: Arc<CacheManager>,
  fetch: Arc<OfflineFetch>,
  processor: Arc<QueueProcessor>,
}

impl SyncEngine {
  /// Build against the configured HTTP API and on-disk store.
  pub async fn open(config: Config) -> Result<Self, EngineError> {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open(path)?,
      None => SqliteStore::open_default()?,
    };
    if let Some(path) = store.path() {
      tracing::debug!(path = %path.display(), "opened offline store");
    }
    Self::open_with_store(config, Arc::new(store)).await
  }

  /// Like [`SyncEngine::open`] but nothing survives the process.
  pub async fn open_ephemeral(config: Config) -> Result<Self, EngineError> {
    Self::open_with_store(config, Arc::new(MemoryStore::new())).await
  }

  async fn open_with_store(config: Config, store: Arc<dyn KvStore>) -> Result<Self, EngineError> {
    let token = Config::session_token();
    if token.is_none() {
      tracing::warn!("no session token set; API calls will be unauthenticated");
    }
    let http = Arc::new(HttpApi::new(&config.api, token.as_deref())?);
    Self::with_parts(config, http.clone(), http, store).await
  }

  /// Assemble from explicit parts. The initial connectivity comes from one
  /// probe.
  pub async fn with_parts(
    config: Config,
    api: Arc<dyn RemoteApi>,
    probe: Arc<dyn NetworkProbe>,
    store: Arc<dyn KvStore>,
  ) -> Result<Self, EngineError> {
    let monitor = ConnectivityMonitor::detect(&*probe).await;
    let events = EventBus::default();

    let queue = Arc::new(OfflineQueue::open(store.clone())?);
    let cache = Arc::new(CacheManager::new(
      api.clone(),
      store,
      monitor.clone(),
      &config.cache,
    ));
    let fetch = Arc::new(OfflineFetch::new(
      api.clone(),
      queue.clone(),
      cache.clone(),
      monitor.clone(),
      events.clone(),
    ));
    let processor = Arc::new(QueueProcessor::new(
      api,
      queue.clone(),
      monitor.clone(),
      events.clone(),
      config.sync.max_retries,
    ));

    tracing::info!(
      connectivity = %monitor.current(),
      pending = queue.count(),
      dead_letters = queue.dead_letter_count(),
      "sync engine ready"
    );

    Ok(Self {
      config,
      probe,
      monitor,
      events,
      queue,
      cache,
      fetch,
      processor,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn fetch(&self) -> &OfflineFetch {
    &self.fetch
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn processor(&self) -> &QueueProcessor {
    &self.processor
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  pub fn events(&self) -> &EventBus {
    &self.events
  }

  pub fn status(&self) -> StatusSnapshot {
    StatusSnapshot {
      connectivity: self.monitor.current(),
      pending: self.queue.count(),
      dead_letters: self.queue.dead_letter_count(),
    }
  }

  /// Start the background tasks:
  /// - connectivity probing
  /// - drain on reconnect and on a timer
  /// - periodic cache refresh (first run is immediate)
  /// - connectivity changes forwarded to the event bus
  pub fn start(&self) -> EngineHandle {
    let (shutdown, rx) = watch::channel(false);
    let sync = &self.config.sync;

    let tasks = vec![
      ConnectivityDetector::new(self.probe.clone(), self.monitor.clone(), sync.probe_interval())
        .spawn(rx.clone()),
      self.processor.clone().spawn(sync.drain_interval(), rx.clone()),
      self.cache.clone().spawn_refresh(
        self.config.cache.refresh_interval(),
        self.events.clone(),
        rx.clone(),
      ),
      forward_connectivity(self.monitor.clone(), self.events.clone(), rx),
    ];

    EngineHandle { shutdown, tasks }
  }
}

fn forward_connectivity(
  monitor: ConnectivityMonitor,
  events: EventBus,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  let mut states = monitor.subscribe();
  tokio::spawn(async move {
    loop {
      tokio::select! {
        changed = states.changed() => {
          if changed.is_err() {
            break;
          }
          let state = *states.borrow_and_update();
          events.emit(SyncEvent::Connectivity(state));
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
  })
}

/// Running background tasks. Dropping the handle leaves them running.
pub struct EngineHandle {
  shutdown: watch::Sender<bool>,
  tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
  /// Signal every task to stop and wait for them.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    for task in self.tasks {
      if let Err(e) = task.await {
        tracing::warn!(error = %e, "background task ended abnormally");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{Dataset, Mutation};
  use crate::cache::CacheSource;
  use crate::connectivity::Connectivity;
  use crate::test_support::{ManualProbe, ScriptedApi};
  use chrono::Utc;
  use serde_json::json;
  use std::time::Duration;

  async fn engine(online: bool) -> (SyncEngine, Arc<ScriptedApi>, Arc<ManualProbe>) {
    let api = Arc::new(ScriptedApi::new());
    let probe = Arc::new(ManualProbe::new(online));
    let engine = SyncEngine::with_parts(
      Config::default(),
      api.clone(),
      probe.clone(),
      Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();
    (engine, api, probe)
  }

  async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
      if done() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  }

  #[tokio::test]
  async fn test_initial_connectivity_comes_from_probe() {
    let (online, _, _) = engine(true).await;
    assert_eq!(online.status().connectivity, Connectivity::Online);

    let (offline, _, _) = engine(false).await;
    assert_eq!(offline.status().connectivity, Connectivity::Offline);
  }

  #[tokio::test]
  async fn test_start_duty_offline_then_reconnect() {
    let (engine, api, probe) = engine(false).await;
    let mut events = engine.events().subscribe();
    let handle = engine.start();

    let start_duty = Mutation::StartDuty {
      session_id: "sess-1".into(),
      staff_id: "staff-9".into(),
      theatre_id: "th-2".into(),
      role: Some("scrub nurse".into()),
      started_at: Utc::now(),
    };
    let outcome = engine.fetch().mutate(&start_duty).await.unwrap();
    assert!(outcome.is_queued());
    assert_eq!(engine.status().pending, 1);
    assert_eq!(api.call_count(), 0);

    probe.set(true);
    engine.monitor().set_network_status(true);
    wait_until(|| engine.queue().is_empty()).await;

    let status = engine.status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.dead_letters, 0);
    assert_eq!(status.connectivity, Connectivity::Online);

    // The cache refresh may also hit the API once reconnected; only the
    // duty log replay matters here
    let duty_calls: Vec<_> = api
      .calls()
      .into_iter()
      .filter(|r| r.path.starts_with("/api/duty-logs"))
      .collect();
    assert_eq!(duty_calls, vec![start_duty.to_request().unwrap()]);

    let mut saw_queued = false;
    let mut saw_drained = false;
    while let Ok(event) = events.try_recv() {
      match event {
        SyncEvent::Queued { .. } => saw_queued = true,
        SyncEvent::Drained(summary) => {
          saw_drained = true;
          assert_eq!(summary.succeeded, 1);
        }
        _ => {}
      }
    }
    assert!(saw_queued);
    assert!(saw_drained);

    handle.shutdown().await;
  }

  #[tokio::test]
  async fn test_start_prefetches_when_online() {
    let (engine, api, _) = engine(true).await;
    api.reply_status("/api/theatres", 200, json!([{ "id": "th-1", "name": "Theatre 1" }]));
    let handle = engine.start();

    wait_until(|| {
      engine
        .cache()
        .cached(Dataset::Theatres)
        .map(|read| read.source() != CacheSource::Missing)
        .unwrap_or(false)
    })
    .await;

    let read = engine.cache().cached(Dataset::Theatres).unwrap();
    assert_eq!(read.payload(), Some(&json!([{ "id": "th-1", "name": "Theatre 1" }])));

    handle.shutdown().await;
  }

  #[tokio::test]
  async fn test_connectivity_changes_reach_event_bus() {
    let (engine, _, _) = engine(true).await;
    let mut events = engine.events().subscribe();
    let handle = engine.start();
    tokio::task::yield_now().await;

    engine.monitor().report_network_failure();

    let event = tokio::time::timeout(Duration::from_secs(1), async {
      loop {
        if let Ok(SyncEvent::Connectivity(state)) = events.recv().await {
          return state;
        }
      }
    })
    .await
    .unwrap();
    assert_eq!(event, Connectivity::Offline);

    handle.shutdown().await;
  }
}
