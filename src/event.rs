//! Sync notifications and the status badge snapshot.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::Method;
use crate::cache::PrefetchReport;
use crate::connectivity::Connectivity;
use crate::offline::{DeadLetter, DrainSummary};

/// Notifications for whatever is presenting sync state to the user.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// Connectivity state changed
  Connectivity(Connectivity),
  /// A write was deferred to the offline queue
  Queued {
    id: Uuid,
    method: Method,
    path: String,
    pending: usize,
  },
  /// A drain ran to completion or stopped early
  Drained(DrainSummary),
  /// A queued write was abandoned
  DeadLettered(Box<DeadLetter>),
  /// A background or manual prefetch finished
  CacheRefreshed(PrefetchReport),
}

/// Fan-out channel for [`SyncEvent`]s.
///
/// Emitting never blocks and never fails; events sent while nobody is
/// subscribed are dropped, and slow subscribers see a lag error.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  pub fn emit(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

/// What a status badge needs: connectivity plus queue counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
  pub connectivity: Connectivity,
  pub pending: usize,
  pub dead_letters: usize,
}
