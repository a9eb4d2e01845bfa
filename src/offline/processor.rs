//! Replays queued writes once the API is reachable again.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{ApiError, RemoteApi};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::event::{EventBus, SyncEvent};

use super::queue::{DeadLetterReason, OfflineQueue, QueueResult, QueuedRequest};

/// Why a drain stopped before the end of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
  /// Connectivity was offline before the next item.
  Offline,
  /// An item got no response.
  Network { error: String },
  /// An item got a 5xx; the server may recover.
  ServerError { status: u16 },
  /// The queue could not be read or updated.
  Storage { error: String },
}

/// Result of one [`QueueProcessor::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
  pub succeeded: usize,
  pub dead_lettered: usize,
  /// Items still queued when the drain finished.
  pub pending: usize,
  pub halted: Option<HaltReason>,
}

impl DrainSummary {
  /// True when at least one item was settled one way or the other.
  pub fn made_progress(&self) -> bool {
    self.succeeded + self.dead_lettered > 0
  }
}

/// Resets the in-progress flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| DrainGuard(flag))
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Per-item verdict while draining.
enum Step {
  Continue,
  Halt(HaltReason),
}

/// Replays the offline queue in order, one request at a time.
///
/// - 2xx/3xx: the item is removed
/// - 4xx: the item is dead-lettered and the drain moves on
/// - 5xx or no response: the retry count goes up and the drain stops, so
///   nothing queued later overtakes it; past `max_retries` it is
///   dead-lettered instead
pub struct QueueProcessor {
  api: Arc<dyn RemoteApi>,
  queue: Arc<OfflineQueue>,
  monitor: ConnectivityMonitor,
  events: EventBus,
  max_retries: u32,
  draining: AtomicBool,
}

impl QueueProcessor {
  pub fn new(
    api: Arc<dyn RemoteApi>,
    queue: Arc<OfflineQueue>,
    monitor: ConnectivityMonitor,
    events: EventBus,
    max_retries: u32,
  ) -> Self {
    Self {
      api,
      queue,
      monitor,
      events,
      max_retries,
      draining: AtomicBool::new(false),
    }
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  /// Replay the queue. Returns `None` if another drain is already running.
  pub async fn drain(&self) -> Option<DrainSummary> {
    let Some(_guard) = DrainGuard::acquire(&self.draining) else {
      tracing::debug!("drain already in progress");
      return None;
    };

    let mut summary = DrainSummary::default();
    summary.halted = match self.replay(&mut summary).await {
      Ok(halt) => halt,
      Err(e) => {
        tracing::error!(error = %e, "queue storage failed during drain");
        Some(HaltReason::Storage {
          error: e.to_string(),
        })
      }
    };
    summary.pending = self.queue.count();

    self.monitor.drain_finished();

    if summary.made_progress() || summary.halted.is_some() {
      tracing::info!(
        succeeded = summary.succeeded,
        dead_lettered = summary.dead_lettered,
        pending = summary.pending,
        halted = ?summary.halted,
        "drain finished"
      );
      self.events.emit(SyncEvent::Drained(summary.clone()));
    }
    Some(summary)
  }

  async fn replay(&self, summary: &mut DrainSummary) -> QueueResult<Option<HaltReason>> {
    for item in self.queue.list()? {
      if self.monitor.is_offline() {
        return Ok(Some(HaltReason::Offline));
      }

      match self.replay_one(&item, summary).await? {
        Step::Continue => {}
        Step::Halt(reason) => return Ok(Some(reason)),
      }
    }
    Ok(None)
  }

  async fn replay_one(&self, item: &QueuedRequest, summary: &mut DrainSummary) -> QueueResult<Step> {
    tracing::debug!(
      id = %item.id,
      method = %item.request.method,
      path = %item.request.path,
      attempt = item.retry_count + 1,
      "replaying"
    );

    match self.api.send(&item.request).await {
      Ok(response) if response.status < 400 => {
        self.queue.remove(item.id)?;
        summary.succeeded += 1;
        Ok(Step::Continue)
      }
      Ok(response) if response.is_client_error() => {
        self.bury(item, DeadLetterReason::rejected(&response), summary)?;
        Ok(Step::Continue)
      }
      Ok(response) => {
        let error = format!("server answered {}", response.status);
        self.retry_later(item, &error, summary)?;
        Ok(Step::Halt(HaltReason::ServerError {
          status: response.status,
        }))
      }
      Err(ApiError::InvalidRequest(error)) => {
        self.bury(item, DeadLetterReason::Invalid { error }, summary)?;
        Ok(Step::Continue)
      }
      Err(e) => {
        self.monitor.report_network_failure();
        self.retry_later(item, &e.to_string(), summary)?;
        Ok(Step::Halt(HaltReason::Network {
          error: e.to_string(),
        }))
      }
    }
  }

  /// Count a transient failure; dead-letter once retries are used up.
  fn retry_later(&self, item: &QueuedRequest, error: &str, summary: &mut DrainSummary) -> QueueResult<()> {
    let attempts = self.queue.record_failure(item.id, error)?.unwrap_or(0);
    if attempts > self.max_retries {
      let reason = DeadLetterReason::Exhausted {
        attempts,
        last_error: error.to_string(),
      };
      self.bury(item, reason, summary)?;
    }
    Ok(())
  }

  fn bury(&self, item: &QueuedRequest, reason: DeadLetterReason, summary: &mut DrainSummary) -> QueueResult<()> {
    if let Some(letter) = self.queue.dead_letter(item.id, reason)? {
      summary.dead_lettered += 1;
      self.events.emit(SyncEvent::DeadLettered(Box::new(letter)));
    }
    Ok(())
  }

  /// Drain on every reconnect and on a fixed timer until `shutdown` flips.
  pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let mut connectivity = self.monitor.subscribe();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if !self.queue.is_empty() && !self.monitor.is_offline() {
              self.drain().await;
            }
          }
          changed = connectivity.changed() => {
            if changed.is_err() {
              break;
            }
            let state = *connectivity.borrow_and_update();
            if state == Connectivity::Reconnecting {
              self.drain().await;
            }
          }
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              break;
            }
          }
        }
      }
      tracing::debug!("queue processor stopped");
    })
  }
}
