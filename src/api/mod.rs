//! Boundary to the theatre-management REST API.
//!
//! The sync core sees every endpoint the same way:
//! `(method, path, json body) -> (status, json body) | ApiError`.
//! A returned [`ApiResponse`] always means the server answered, whatever the
//! status; an [`ApiError`] means it did not.

mod client;
mod types;

pub use client::HttpApi;
pub use types::{
  Allocation, Dataset, DatasetRecord, EquipmentItem, FaultSeverity, Mutation, StaffMember,
  StaffRef, SurgeryStatus, Theatre, TheatreRef, ValidationError,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type for calls that never produced a server response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
  /// The server could not be reached or the connection dropped.
  #[error("network unreachable: {0}")]
  Network(String),

  /// No response within the configured timeout.
  #[error("request timed out")]
  Timeout,

  /// The request could not be built (bad path, unencodable body).
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl ApiError {
  /// True when the failure is about reachability rather than the request itself.
  pub fn is_network(&self) -> bool {
    matches!(self, ApiError::Network(_) | ApiError::Timeout)
  }
}

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Reads are served from cache when offline and never queued.
  pub fn is_read(&self) -> bool {
    matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(ValidationError::UnknownMethod(other.to_string())),
    }
  }
}

/// One call against the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
  pub method: Method,
  /// Absolute path on the API host, e.g. `/api/duty-logs`.
  pub path: String,
  pub body: Option<Value>,
}

impl ApiRequest {
  /// Build a request, rejecting paths that are not rooted at `/`.
  pub fn new(
    method: Method,
    path: impl Into<String>,
    body: Option<Value>,
  ) -> Result<Self, ValidationError> {
    let path = path.into();
    if !path.starts_with('/') || path.contains("://") {
      return Err(ValidationError::BadPath(path));
    }
    Ok(Self { method, path, body })
  }

  pub fn get(path: impl Into<String>) -> Result<Self, ValidationError> {
    Self::new(Method::Get, path, None)
  }

  /// Stable identity for this request: SHA-256 over method, path and body.
  pub fn fingerprint(&self) -> String {
    let body = self
      .body
      .as_ref()
      .map(Value::to_string)
      .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response the server actually sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
  pub status: u16,
  pub body: Value,
}

impl ApiResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// 4xx: the server rejected the request itself.
  pub fn is_client_error(&self) -> bool {
    (400..500).contains(&self.status)
  }

  pub fn is_server_error(&self) -> bool {
    self.status >= 500
  }

  /// Server-provided error message, when the body carries one.
  pub fn error_message(&self) -> Option<&str> {
    self
      .body
      .get("error")
      .or_else(|| self.body.get("message"))
      .and_then(Value::as_str)
  }
}

/// Transport to the remote API.
///
/// Implemented over HTTP by [`HttpApi`]; tests substitute scripted fakes.
pub trait RemoteApi: Send + Sync {
  /// Perform `request` and return whatever the server answered.
  fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse, ApiError>>;
}

impl<T: RemoteApi + ?Sized> RemoteApi for Arc<T> {
  fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
    (**self).send(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_request_rejects_unrooted_paths() {
    assert!(ApiRequest::new(Method::Post, "api/duty-logs", None).is_err());
    assert!(ApiRequest::new(Method::Post, "https://evil.example/api", None).is_err());
    assert!(ApiRequest::new(Method::Post, "/api/duty-logs", None).is_ok());
  }

  #[test]
  fn test_fingerprint_tracks_body() {
    let a = ApiRequest::new(Method::Post, "/api/duty-logs", Some(json!({"staffId": "s1"}))).unwrap();
    let b = ApiRequest::new(Method::Post, "/api/duty-logs", Some(json!({"staffId": "s1"}))).unwrap();
    let c = ApiRequest::new(Method::Post, "/api/duty-logs", Some(json!({"staffId": "s2"}))).unwrap();

    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.fingerprint(), c.fingerprint());
    assert_eq!(a.fingerprint().len(), 64);
  }

  #[test]
  fn test_method_parsing() {
    assert_eq!("patch".parse::<Method>().unwrap(), Method::Patch);
    assert!("BREW".parse::<Method>().is_err());
    assert!(Method::Get.is_read());
    assert!(!Method::Delete.is_read());
  }

  #[test]
  fn test_response_classification() {
    let rejected = ApiResponse::new(422, json!({"error": "theatre not found"}));
    assert!(rejected.is_client_error());
    assert!(!rejected.is_success());
    assert_eq!(rejected.error_message(), Some("theatre not found"));

    assert!(ApiResponse::new(503, Value::Null).is_server_error());
    assert!(ApiResponse::new(201, Value::Null).is_success());
  }

  #[test]
  fn test_api_error_network_classification() {
    assert!(ApiError::Timeout.is_network());
    assert!(ApiError::Network("refused".into()).is_network());
    assert!(!ApiError::InvalidRequest("bad".into()).is_network());
  }
}
