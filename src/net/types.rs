//! Request and response values that flow through the interception layer.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

pub const CONTENT_TYPE: &str = "content-type";

/// Headers that describe a single connection rather than the resource and
/// therefore never cross the proxy in either direction.
const CONNECTION_HEADERS: &[&str] = &[
  "connection",
  "content-length",
  "host",
  "keep-alive",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Whether a header may be copied between the inbound and upstream exchange.
pub fn is_forwardable(name: &str) -> bool {
  !CONNECTION_HEADERS
    .iter()
    .any(|skipped| skipped.eq_ignore_ascii_case(name))
}

/// An outgoing request from the application.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  #[allow(dead_code)]
  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }
}

/// A response as captured from the network or replayed from the cache.
///
/// Bodies are fully buffered, so handing one copy to the cache and another
/// to the caller is an explicit `clone()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// First value of a header, matched case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Synthesized answer for API requests when neither the network nor the
  /// cache can provide one.
  pub fn offline_placeholder(message: &str) -> Self {
    let body = serde_json::json!({
      "offline": true,
      "message": message,
    });

    Self::new(503, body.to_string()).with_header(CONTENT_TYPE, "application/json")
  }
}
