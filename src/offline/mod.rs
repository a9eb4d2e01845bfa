//! Offline write path.
//!
//! Writes made while the API is unreachable are persisted and replayed later,
//! in the order they were made.
//!
//! ```text
//!   caller ──► OfflineFetch ──► RemoteApi
//!                 │   ▲ (network error / offline)
//!                 ▼   │
//!            OfflineQueue ◄── QueueProcessor ──► RemoteApi
//!                 │                 (drain on reconnect / timer)
//!                 ▼
//!            dead letters (rejected or out of retries)
//! ```
//!
//! Application errors (4xx/5xx on a direct call) go straight back to the
//! caller. Only the absence of a response queues a write.

mod fetch;
mod processor;
mod queue;

pub use fetch::{FetchError, FetchOutcome, OfflineFetch, QueuedReceipt};
pub use processor::{DrainSummary, HaltReason, QueueProcessor};
pub use queue::{DeadLetter, DeadLetterReason, OfflineQueue, QueueError, QueueResult, QueuedRequest};
