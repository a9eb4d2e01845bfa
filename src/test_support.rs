//! Fakes shared by the unit tests.

use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::api::{ApiError, ApiRequest, ApiResponse, BoxFuture, RemoteApi};
use crate::connectivity::NetworkProbe;

/// Remote API that replies from a per-path script and records every call.
///
/// Unscripted calls answer `200 {"ok": true}`. While `unreachable` is set
/// every call fails with a network error and is still recorded.
#[derive(Default)]
pub struct ScriptedApi {
  scripts: Mutex<HashMap<String, VecDeque<Result<ApiResponse, ApiError>>>>,
  calls: Mutex<Vec<ApiRequest>>,
  unreachable: AtomicBool,
}

impl ScriptedApi {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queue the next reply for `path`.
  pub fn reply(&self, path: &str, result: Result<ApiResponse, ApiError>) {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .push_back(result);
  }

  pub fn reply_status(&self, path: &str, status: u16, body: Value) {
    self.reply(path, Ok(ApiResponse::new(status, body)));
  }

  pub fn reply_network_error(&self, path: &str) {
    self.reply(path, Err(ApiError::Network("connection refused".into())));
  }

  pub fn set_unreachable(&self, unreachable: bool) {
    self.unreachable.store(unreachable, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn paths(&self) -> Vec<String> {
    self.calls().into_iter().map(|r| r.path).collect()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl RemoteApi for ScriptedApi {
  fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
    Box::pin(async move {
      self.calls.lock().unwrap().push(request.clone());

      // Replies are taken in call order, before any interleaving
      let reply = if self.unreachable.load(Ordering::SeqCst) {
        Err(ApiError::Network("connection refused".into()))
      } else {
        self
          .scripts
          .lock()
          .unwrap()
          .get_mut(&request.path)
          .and_then(VecDeque::pop_front)
          .unwrap_or_else(|| Ok(ApiResponse::new(200, json!({ "ok": true }))))
      };

      // Let other tasks interleave, as a real network call would
      tokio::task::yield_now().await;
      reply
    })
  }
}

/// Probe whose answer is set by the test.
pub struct ManualProbe {
  online: AtomicBool,
}

impl ManualProbe {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn set(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

impl NetworkProbe for ManualProbe {
  fn probe(&self) -> BoxFuture<'_, bool> {
    let online = self.online.load(Ordering::SeqCst);
    Box::pin(async move { online })
  }
}
