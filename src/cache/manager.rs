//! Prefetch and offline fallback for reference datasets.

use chrono::{Duration, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{ApiError, Dataset, RemoteApi};
use crate::config::CacheConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::event::{EventBus, SyncEvent};
use crate::storage::{KvStore, StorageError};

use super::dataset::{CachedDataset, DatasetRead};
use super::{CacheError, CacheResult};

const CACHE_PREFIX: &str = "cache/";

/// Result of one [`CacheManager::prefetch_all`] run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefetchReport {
  pub generation: u64,
  pub refreshed: Vec<Dataset>,
  /// Datasets whose refresh failed; their previous snapshot is untouched.
  pub failed: Vec<(Dataset, String)>,
  /// Results discarded because a newer prefetch started meanwhile.
  pub superseded: Vec<Dataset>,
  /// Nothing was attempted because the client is offline.
  pub skipped_offline: bool,
}

/// Why a live dataset fetch produced nothing usable.
#[derive(Debug)]
enum LiveFailure {
  Network(ApiError),
  Status(u16),
  Other(ApiError),
}

impl std::fmt::Display for LiveFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LiveFailure::Network(e) | LiveFailure::Other(e) => write!(f, "{}", e),
      LiveFailure::Status(status) => write!(f, "server answered {}", status),
    }
  }
}

/// Keeps reference datasets available offline.
///
/// 1. `prefetch_all` pulls every configured dataset and replaces each
///    snapshot wholesale
/// 2. `get` prefers the live API and falls back to the last snapshot
/// 3. A failed refresh never touches the existing snapshot
pub struct CacheManager {
  api: Arc<dyn RemoteApi>,
  store: Arc<dyn KvStore>,
  monitor: ConnectivityMonitor,
  datasets: Vec<Dataset>,
  freshness: Duration,
  generation: AtomicU64,
}

impl CacheManager {
  pub fn new(
    api: Arc<dyn RemoteApi>,
    store: Arc<dyn KvStore>,
    monitor: ConnectivityMonitor,
    config: &CacheConfig,
  ) -> Self {
    Self {
      api,
      store,
      monitor,
      datasets: config.datasets.clone(),
      freshness: config.freshness(),
      generation: AtomicU64::new(0),
    }
  }

  pub fn datasets(&self) -> &[Dataset] {
    &self.datasets
  }

  /// Fetch every configured dataset and store the ones that succeed.
  ///
  /// Datasets are fetched concurrently; each is independent of the others.
  pub async fn prefetch_all(&self) -> PrefetchReport {
    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let mut report = PrefetchReport {
      generation,
      ..PrefetchReport::default()
    };

    if self.monitor.is_offline() {
      report.skipped_offline = true;
      tracing::debug!("offline, skipping prefetch");
      return report;
    }

    let fetches = self
      .datasets
      .iter()
      .map(|&dataset| async move { (dataset, self.fetch_live(dataset).await) });
    let results = join_all(fetches).await;

    for (dataset, result) in results {
      if self.generation.load(Ordering::SeqCst) != generation {
        tracing::debug!(%dataset, generation, "prefetch superseded, discarding result");
        report.superseded.push(dataset);
        continue;
      }

      match result.map(|payload| self.store_snapshot(dataset, payload)) {
        Ok(Ok(_)) => report.refreshed.push(dataset),
        Ok(Err(e)) => {
          tracing::error!(%dataset, error = %e, "failed to store prefetched dataset");
          report.failed.push((dataset, e.to_string()));
        }
        Err(e) => {
          tracing::warn!(%dataset, error = %e, "prefetch failed, keeping cached copy");
          report.failed.push((dataset, e.to_string()));
        }
      }
    }

    tracing::info!(
      refreshed = report.refreshed.len(),
      failed = report.failed.len(),
      "prefetch finished"
    );
    report
  }

  /// Live data when reachable, otherwise the last snapshot with its age.
  ///
  /// Only a storage failure is an error; no cached data is reported as
  /// [`DatasetRead::Missing`].
  pub async fn get(&self, dataset: Dataset) -> CacheResult<DatasetRead> {
    if !self.monitor.is_offline() {
      match self.fetch_live(dataset).await {
        Ok(payload) => {
          let snapshot = CachedDataset::new(dataset, payload, self.freshness);
          if let Err(e) = self.write(&snapshot) {
            tracing::error!(%dataset, error = %e, "failed to cache live dataset");
          }
          return Ok(DatasetRead::Live(snapshot));
        }
        Err(e) => {
          tracing::debug!(%dataset, error = %e, "live fetch failed, serving cache");
        }
      }
    }

    self.cached(dataset)
  }

  /// The last stored snapshot, without touching the network.
  pub fn cached(&self, dataset: Dataset) -> CacheResult<DatasetRead> {
    Ok(match self.load(dataset)? {
      Some(snapshot) => DatasetRead::from_snapshot(snapshot, Utc::now()),
      None => DatasetRead::Missing(dataset),
    })
  }

  /// Replace the snapshot for `dataset` with `payload`.
  pub fn store_snapshot(&self, dataset: Dataset, payload: Value) -> CacheResult<CachedDataset> {
    let snapshot = CachedDataset::new(dataset, payload, self.freshness);
    self.write(&snapshot)?;
    Ok(snapshot)
  }

  /// Refresh on a timer until `shutdown` flips. Failures are logged and
  /// swallowed; offline ticks are skipped.
  pub fn spawn_refresh(
    self: Arc<Self>,
    interval: std::time::Duration,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if self.monitor.is_offline() {
              continue;
            }
            let report = self.prefetch_all().await;
            events.emit(SyncEvent::CacheRefreshed(report));
          }
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              break;
            }
          }
        }
      }
      tracing::debug!("cache refresh stopped");
    })
  }

  async fn fetch_live(&self, dataset: Dataset) -> Result<Value, LiveFailure> {
    match self.api.send(&dataset.request()).await {
      Ok(response) if response.is_success() => Ok(response.body),
      Ok(response) => Err(LiveFailure::Status(response.status)),
      Err(e) if e.is_network() => {
        self.monitor.report_network_failure();
        Err(LiveFailure::Network(e))
      }
      Err(e) => Err(LiveFailure::Other(e)),
    }
  }

  fn write(&self, snapshot: &CachedDataset) -> CacheResult<()> {
    let bytes = serde_json::to_vec(snapshot).map_err(StorageError::from)?;
    self.store.put(&cache_key(snapshot.dataset), &bytes)?;
    Ok(())
  }

  fn load(&self, dataset: Dataset) -> CacheResult<Option<CachedDataset>> {
    let Some(bytes) = self.store.get(&cache_key(dataset))? else {
      return Ok(None);
    };
    serde_json::from_slice(&bytes)
      .map(Some)
      .map_err(|source| CacheError::Decode { dataset, source })
  }
}

fn cache_key(dataset: Dataset) -> String {
  format!("{}{}", CACHE_PREFIX, dataset.key())
}
