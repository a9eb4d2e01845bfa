//! Offline-first sync core for the theatre management API.
//!
//! Writes go through [`OfflineFetch`], which queues them when the API cannot
//! be reached; [`QueueProcessor`] replays the queue on reconnect. Reference
//! data is prefetched into [`CacheManager`] so reads keep working offline.
//! [`SyncEngine`] wires everything to a single [`ConnectivityMonitor`].

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod event;
pub mod logging;
pub mod offline;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use cache::CacheManager;
pub use config::Config;
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use engine::{EngineError, EngineHandle, SyncEngine};
pub use event::{EventBus, StatusSnapshot, SyncEvent};
pub use offline::{OfflineFetch, OfflineQueue, QueueProcessor};
