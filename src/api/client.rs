//! reqwest-backed client for the theatre API.

use reqwest::cookie::Jar;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::ApiConfig;
use crate::connectivity::NetworkProbe;

use super::{ApiError, ApiRequest, ApiResponse, BoxFuture, Method, RemoteApi};

/// HTTP client for the theatre API.
///
/// Authentication rides on the session cookie; the client never looks at it
/// beyond installing it in the cookie jar.
#[derive(Clone)]
pub struct HttpApi {
  client: reqwest::Client,
  base_url: Url,
  health_path: String,
}

impl HttpApi {
  pub fn new(config: &ApiConfig, session: Option<&str>) -> Result<Self, ApiError> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| ApiError::InvalidRequest(format!("bad base url {}: {}", config.base_url, e)))?;

    let jar = Jar::default();
    if let Some(token) = session {
      jar.add_cookie_str(&format!("{}={}", config.session_cookie, token), &base_url);
    }

    let client = reqwest::Client::builder()
      .cookie_provider(Arc::new(jar))
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| ApiError::InvalidRequest(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      health_path: config.health_path.clone(),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base_url
      .join(path)
      .map_err(|e| ApiError::InvalidRequest(format!("bad path {}: {}", path, e)))
  }

  async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
    let url = self.endpoint(&request.path)?;

    let mut builder = match request.method {
      Method::Get => self.client.get(url),
      Method::Post => self.client.post(url),
      Method::Put => self.client.put(url),
      Method::Patch => self.client.patch(url),
      Method::Delete => self.client.delete(url),
    };
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(classify)?;
    let status = response.status().as_u16();
    tracing::debug!(method = %request.method, path = %request.path, status, "api call");

    // The server answered; a broken body must not turn this into a
    // network error, or the write would be queued and sent twice.
    match response.bytes().await {
      Ok(bytes) => Ok(ApiResponse::new(status, parse_body(&bytes))),
      Err(e) => {
        tracing::warn!(
          method = %request.method,
          path = %request.path,
          status,
          error = %e,
          "failed to read response body"
        );
        Ok(ApiResponse::new(status, Value::Null))
      }
    }
  }
}

impl RemoteApi for HttpApi {
  fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
    Box::pin(self.execute(request))
  }
}

impl NetworkProbe for HttpApi {
  /// Any HTTP answer from the health endpoint counts as reachable.
  fn probe(&self) -> BoxFuture<'_, bool> {
    Box::pin(async move {
      let Ok(request) = ApiRequest::get(self.health_path.clone()) else {
        return false;
      };
      self.execute(&request).await.is_ok()
    })
  }
}

/// Map a reqwest failure onto the network / invalid-request split.
fn classify(e: reqwest::Error) -> ApiError {
  if e.is_timeout() {
    ApiError::Timeout
  } else if e.is_builder() {
    ApiError::InvalidRequest(e.to_string())
  } else {
    ApiError::Network(e.to_string())
  }
}

/// Decode a response body, keeping non-JSON bodies as a string.
fn parse_body(bytes: &[u8]) -> Value {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
