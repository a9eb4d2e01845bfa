//! Offline cache for read-heavy reference data.
//!
//! This module keeps named dataset snapshots (theatre list, today's
//! allocations, ...) so screens can still render when the API is unreachable:
//! - Prefetches every configured dataset, replacing snapshots wholesale
//! - Serves live data when online, the last snapshot when not
//! - Reports snapshot age and staleness instead of hiding it
//! - Refreshes periodically in the background, best effort

mod dataset;
mod manager;

pub use dataset::{CacheSource, CachedDataset, DatasetRead};
pub use manager::{CacheManager, PrefetchReport};

use crate::api::Dataset;
use crate::storage::StorageError;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("failed to decode cached {dataset}: {source}")]
  Decode {
    dataset: Dataset,
    source: serde_json::Error,
  },

  #[error("snapshot holds {found}, not {expected}")]
  WrongDataset { expected: Dataset, found: Dataset },
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
