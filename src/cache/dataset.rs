//! Cached dataset snapshots and the results of reading them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{Dataset, DatasetRecord};

use super::CacheError;

/// A whole snapshot of one reference dataset.
///
/// Snapshots are only ever replaced wholesale; there is no partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDataset {
  pub dataset: Dataset,
  pub payload: Value,
  pub fetched_at: DateTime<Utc>,
  /// How long after `fetched_at` the snapshot counts as fresh, in seconds.
  pub freshness_secs: i64,
}

impl CachedDataset {
  pub fn new(dataset: Dataset, payload: Value, freshness: Duration) -> Self {
    Self {
      dataset,
      payload,
      fetched_at: Utc::now(),
      freshness_secs: freshness.num_seconds(),
    }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    (now - self.fetched_at).max(Duration::zero())
  }

  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    // A window too large to represent never expires
    Duration::try_seconds(self.freshness_secs).is_some_and(|window| self.age(now) > window)
  }

  /// Decode the payload as a list of `T`.
  pub fn records<T: DatasetRecord>(&self) -> Result<Vec<T>, CacheError> {
    if T::DATASET != self.dataset {
      return Err(CacheError::WrongDataset {
        expected: T::DATASET,
        found: self.dataset,
      });
    }
    serde_json::from_value(self.payload.clone()).map_err(|source| CacheError::Decode {
      dataset: self.dataset,
      source,
    })
  }
}

/// Where a dataset read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cached snapshot still inside its freshness window
  CacheFresh,
  /// Cached snapshot past its freshness window
  CacheStale,
  /// Nothing cached and the network unavailable
  Missing,
}

/// Outcome of [`CacheManager::get`](super::CacheManager::get).
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetRead {
  /// Fetched live; the cache now holds this snapshot.
  Live(CachedDataset),
  /// Network unavailable; last cached snapshot with its age.
  Cached {
    snapshot: CachedDataset,
    age: Duration,
    stale: bool,
  },
  /// Network unavailable and nothing cached.
  Missing(Dataset),
}

impl DatasetRead {
  pub(crate) fn from_snapshot(snapshot: CachedDataset, now: DateTime<Utc>) -> Self {
    DatasetRead::Cached {
      age: snapshot.age(now),
      stale: snapshot.is_stale(now),
      snapshot,
    }
  }

  pub fn dataset(&self) -> Dataset {
    match self {
      DatasetRead::Live(s) | DatasetRead::Cached { snapshot: s, .. } => s.dataset,
      DatasetRead::Missing(d) => *d,
    }
  }

  pub fn source(&self) -> CacheSource {
    match self {
      DatasetRead::Live(_) => CacheSource::Network,
      DatasetRead::Cached { stale: false, .. } => CacheSource::CacheFresh,
      DatasetRead::Cached { stale: true, .. } => CacheSource::CacheStale,
      DatasetRead::Missing(_) => CacheSource::Missing,
    }
  }

  pub fn snapshot(&self) -> Option<&CachedDataset> {
    match self {
      DatasetRead::Live(s) | DatasetRead::Cached { snapshot: s, .. } => Some(s),
      DatasetRead::Missing(_) => None,
    }
  }

  pub fn payload(&self) -> Option<&Value> {
    self.snapshot().map(|s| &s.payload)
  }

  /// True when served from cache rather than the network.
  pub fn is_offline(&self) -> bool {
    !matches!(self, DatasetRead::Live(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{Allocation, Theatre};
  use serde_json::json;

  fn snapshot_aged(dataset: Dataset, payload: Value, now: DateTime<Utc>, age_secs: i64) -> CachedDataset {
    let mut s = CachedDataset::new(dataset, payload, Duration::seconds(600));
    s.fetched_at = now - Duration::seconds(age_secs);
    s
  }

  #[test]
  fn test_staleness_window() {
    let now = Utc::now();
    let fresh = snapshot_aged(Dataset::Theatres, json!([]), now, 60);
    let stale = snapshot_aged(Dataset::Theatres, json!([]), now, 3600);

    assert!(!fresh.is_stale(now));
    assert!(stale.is_stale(now));
    assert_eq!(stale.age(now), Duration::seconds(3600));
  }

  #[test]
  fn test_unrepresentable_window_never_expires() {
    let now = Utc::now();
    let mut snapshot = snapshot_aged(Dataset::Theatres, json!([]), now, 3600);
    snapshot.freshness_secs = i64::MAX;
    assert!(!snapshot.is_stale(now));
  }

  #[test]
  fn test_read_source() {
    let now = Utc::now();
    let stale = DatasetRead::from_snapshot(snapshot_aged(Dataset::Theatres, json!([]), now, 3600), now);
    assert_eq!(stale.source(), CacheSource::CacheStale);
    assert!(stale.is_offline());

    let missing = DatasetRead::Missing(Dataset::Staff);
    assert_eq!(missing.source(), CacheSource::Missing);
    assert_eq!(missing.payload(), None);
    assert_eq!(missing.dataset(), Dataset::Staff);
  }

  #[test]
  fn test_records_decode_typed() {
    let snapshot = snapshot_aged(
      Dataset::Theatres,
      json!([{ "id": "th-1", "name": "Theatre 1" }, { "id": "th-2", "name": "Theatre 2", "status": "CLOSED" }]),
      Utc::now(),
      0,
    );

    let theatres: Vec<Theatre> = snapshot.records().unwrap();
    assert_eq!(theatres.len(), 2);
    assert_eq!(theatres[1].status.as_deref(), Some("CLOSED"));

    assert!(matches!(
      snapshot.records::<Allocation>(),
      Err(CacheError::WrongDataset { .. })
    ));
  }
}
