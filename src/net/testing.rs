//! In-memory network used by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{FetchError, Network, Request, Response};

/// Serves canned responses by URL and can be switched offline.
/// Unknown URLs answer 404, like a reachable server would.
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<String>>,
  online: AtomicBool,
  delay: Mutex<Option<Duration>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
      online: AtomicBool::new(true),
      delay: Mutex::new(None),
    }
  }

  pub fn route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Total number of fetches attempted, online or not.
  pub fn calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Number of fetches attempted for one URL.
  pub fn calls_to(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|called| called.as_str() == url)
      .count()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::Unreachable(url));
    }

    let response = self.routes.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "not found")))
  }
}
