//! Connectivity state shared by the fetch wrapper, queue processor and cache.
//!
//! ```text
//!            status offline / request failed
//!   ONLINE ─────────────────────────────────► OFFLINE
//!     ▲                                         │  ▲
//!     │ drain finished          status online   │  │ status offline /
//!     │                                         ▼  │ request failed
//!     └──────────────────────────────────── RECONNECTING
//! ```
//!
//! The state lives in one [`ConnectivityMonitor`]; every change goes through
//! its transition table and is published on a `tokio::sync::watch` channel.
//! Readers hold cheap clones or receivers.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::BoxFuture;

/// The process's current belief about network reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
  Online,
  Offline,
  /// Network is back; queued writes are being replayed.
  Reconnecting,
}

/// Input to the connectivity state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  /// The platform reported the network as up.
  StatusOnline,
  /// The platform reported the network as down.
  StatusOffline,
  /// A live request failed without reaching the server.
  RequestFailed,
  /// A queue drain ran to completion.
  DrainFinished,
}

impl Connectivity {
  pub fn from_status(online: bool) -> Self {
    if online {
      Connectivity::Online
    } else {
      Connectivity::Offline
    }
  }

  pub fn is_offline(&self) -> bool {
    matches!(self, Connectivity::Offline)
  }

  /// Next state after `signal`.
  pub fn apply(self, signal: Signal) -> Connectivity {
    use Connectivity::*;
    use Signal::*;

    match (self, signal) {
      (_, StatusOffline) | (_, RequestFailed) => Offline,
      (Offline, StatusOnline) => Reconnecting,
      (Reconnecting, DrainFinished) => Online,
      (state, _) => state,
    }
  }
}

impl fmt::Display for Connectivity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Connectivity::Online => "online",
      Connectivity::Offline => "offline",
      Connectivity::Reconnecting => "reconnecting",
    })
  }
}

/// Authoritative holder of the [`Connectivity`] state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _rx) = watch::channel(Connectivity::from_status(initially_online));
    Self { tx: Arc::new(tx) }
  }

  /// Build a monitor whose initial state comes from one probe.
  pub async fn detect(probe: &dyn NetworkProbe) -> Self {
    Self::new(probe.probe().await)
  }

  pub fn current(&self) -> Connectivity {
    *self.tx.borrow()
  }

  pub fn is_offline(&self) -> bool {
    self.current().is_offline()
  }

  /// Receiver notified on every state change.
  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.tx.subscribe()
  }

  /// Feed the platform's network status.
  pub fn set_network_status(&self, online: bool) -> Connectivity {
    self.signal(if online {
      Signal::StatusOnline
    } else {
      Signal::StatusOffline
    })
  }

  /// A live call got no response.
  pub fn report_network_failure(&self) -> Connectivity {
    self.signal(Signal::RequestFailed)
  }

  pub(crate) fn drain_finished(&self) -> Connectivity {
    self.signal(Signal::DrainFinished)
  }

  fn signal(&self, signal: Signal) -> Connectivity {
    self.tx.send_if_modified(|state| {
      let next = state.apply(signal);
      if next == *state {
        return false;
      }
      tracing::info!(from = %state, to = %next, ?signal, "connectivity changed");
      *state = next;
      true
    });
    self.current()
  }
}

/// Source of the platform's network status.
pub trait NetworkProbe: Send + Sync {
  /// True when the remote API is currently reachable.
  fn probe(&self) -> BoxFuture<'_, bool>;
}

impl<T: NetworkProbe + ?Sized> NetworkProbe for Arc<T> {
  fn probe(&self) -> BoxFuture<'_, bool> {
    (**self).probe()
  }
}

/// Periodically probes the network and feeds the monitor.
pub struct ConnectivityDetector {
  probe: Arc<dyn NetworkProbe>,
  monitor: ConnectivityMonitor,
  interval: Duration,
}

impl ConnectivityDetector {
  pub fn new(probe: Arc<dyn NetworkProbe>, monitor: ConnectivityMonitor, interval: Duration) -> Self {
    Self {
      probe,
      monitor,
      interval,
    }
  }

  /// Probe once and report the result.
  pub async fn check(&self) -> Connectivity {
    let online = self.probe.probe().await;
    self.monitor.set_network_status(online)
  }

  /// Run until `shutdown` flips to true or its sender is dropped.
  pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            self.check().await;
          }
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              break;
            }
          }
        }
      }
      tracing::debug!("connectivity detector stopped");
    })
  }
}
