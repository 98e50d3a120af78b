//! Request interceptor that routes every outgoing request through the cache.

use tracing::debug;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, Strategy};
use crate::lifecycle::ActiveGeneration;
use crate::routes::RouteClassifier;

use super::{FetchError, Network, Request, Response};

/// Intercepts application requests and applies a caching strategy to each.
///
/// Only GET requests are cached. Everything else goes straight to the
/// network so writes are never replayed or faked.
pub struct Interceptor<S: CacheStorage, N: Network> {
  layer: CacheLayer<S, N>,
  classifier: RouteClassifier,
  generation: ActiveGeneration,
}

impl<S, N> Interceptor<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(
    layer: CacheLayer<S, N>,
    classifier: RouteClassifier,
    generation: ActiveGeneration,
  ) -> Self {
    Self {
      layer,
      classifier,
      generation,
    }
  }

  /// Serve one request.
  pub async fn handle(&self, request: Request) -> Result<CacheResult<Response>, FetchError> {
    if !request.is_get() {
      return self.layer.bypass(request).await;
    }

    let category = self.classifier.classify(request.url.path());
    let strategy = Strategy::for_category(category);
    let generation = self.generation.get();
    debug!(
      url = %request.url,
      ?category,
      strategy = strategy.name(),
      generation = %generation,
      "Intercepted request"
    );

    strategy.execute(&self.layer, &generation, request).await
  }

  /// Wait for background cache refreshes to finish.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }
}

impl<S: CacheStorage, N: Network> Clone for Interceptor<S, N> {
  fn clone(&self) -> Self {
    Self {
      layer: self.layer.clone(),
      classifier: self.classifier.clone(),
      generation: self.generation.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage, RequestKey};
  use crate::config::RoutesConfig;
  use crate::net::testing::FakeNetwork;
  use reqwest::Method;
  use std::sync::Arc;
  use url::Url;

  const GEN: &str = "jaytipargal-v1";

  fn setup() -> (
    Arc<MemoryStorage>,
    Arc<FakeNetwork>,
    Interceptor<MemoryStorage, FakeNetwork>,
  ) {
    let storage = Arc::new(MemoryStorage::new());
    storage.open(GEN).unwrap();
    let network = Arc::new(FakeNetwork::new());
    let layer = CacheLayer::new(Arc::clone(&storage), Arc::clone(&network), "offline");
    let interceptor = Interceptor::new(
      layer,
      RouteClassifier::from_config(&RoutesConfig::default()),
      ActiveGeneration::new(GEN),
    );
    (storage, network, interceptor)
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("http://app.test{}", path)).unwrap()
  }

  #[tokio::test]
  async fn test_dashboard_served_offline_after_first_visit() {
    let (_storage, network, interceptor) = setup();
    network.route(url("/dashboard/").as_str(), Response::new(200, "dashboard-html"));

    let online = interceptor.handle(Request::get(url("/dashboard/"))).await.unwrap();
    assert_eq!(online.data.body, b"dashboard-html".to_vec());

    network.set_online(false);
    let offline = interceptor.handle(Request::get(url("/dashboard/"))).await.unwrap();
    assert_eq!(offline.data.body, b"dashboard-html".to_vec());
    assert_eq!(offline.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_api_offline_with_empty_cache_returns_envelope() {
    let (_storage, network, interceptor) = setup();
    network.set_online(false);

    let result = interceptor.handle(Request::get(url("/api/goals/"))).await.unwrap();

    assert_eq!(result.data.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&result.data.body).unwrap();
    assert_eq!(body["offline"], true);
    assert!(body["message"].is_string());
  }

  #[tokio::test]
  async fn test_non_get_requests_bypass_cache() {
    let (storage, network, interceptor) = setup();
    network.route(url("/api/goals/").as_str(), Response::new(201, "created"));
    let post = Request::new(Method::POST, url("/api/goals/")).with_body(r#"{"title":"run"}"#);

    let result = interceptor.handle(post.clone()).await.unwrap();
    assert_eq!(result.source, CacheSource::Bypass);
    assert_eq!(result.data.status, 201);

    // Offline writes fail loudly instead of being faked
    network.set_online(false);
    assert!(interceptor.handle(post).await.is_err());
    assert!(storage
      .lookup(GEN, &RequestKey::new(&Method::POST, &url("/api/goals/")))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_other_routes_use_cache_with_fallback() {
    let (storage, network, interceptor) = setup();
    network.route(url("/ai-chat/").as_str(), Response::new(200, "chat"));

    interceptor.handle(Request::get(url("/ai-chat/"))).await.unwrap();
    interceptor.settle().await;

    network.route(url("/ai-chat/").as_str(), Response::new(200, "chat-v2"));
    let result = interceptor.handle(Request::get(url("/ai-chat/"))).await.unwrap();
    assert_eq!(result.data.body, b"chat".to_vec());

    interceptor.settle().await;
    let cached = storage
      .lookup(GEN, &RequestKey::from(&Request::get(url("/ai-chat/"))))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"chat-v2".to_vec());
  }

  #[tokio::test]
  async fn test_reads_are_scoped_to_generation() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(FakeNetwork::new());
    network.set_online(false);
    let key = RequestKey::from(&Request::get(url("/notes/")));
    storage.open("v0").unwrap();
    storage.store("v0", &key, &Response::new(200, "old-notes")).unwrap();

    let interceptor = Interceptor::new(
      CacheLayer::new(Arc::clone(&storage), Arc::clone(&network), "offline"),
      RouteClassifier::from_config(&RoutesConfig::default()),
      ActiveGeneration::new("v1"),
    );

    // Not cached in v1
    assert!(interceptor.handle(Request::get(url("/notes/"))).await.is_err());

    let controlled_by_v0 = Interceptor::new(
      CacheLayer::new(storage, network, "offline"),
      RouteClassifier::from_config(&RoutesConfig::default()),
      ActiveGeneration::new("v0"),
    );
    let result = controlled_by_v0
      .handle(Request::get(url("/notes/")))
      .await
      .unwrap();
    assert_eq!(result.data.body, b"old-notes".to_vec());
  }
}
