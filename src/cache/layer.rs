//! Cache layer that orchestrates caching logic with network fetching.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedResponse, RequestKey};
use crate::net::{FetchError, Network, Request, Response};

/// Responses with this status carry a partial body and are never cached.
const PARTIAL_CONTENT: u16 = 206;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network, providing the
/// three serving strategies over a generation of the cache store.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  /// Message inside the synthesized offline response
  offline_message: Arc<str>,
  /// Background refreshes started by cache-with-fallback. Dropping the last
  /// clone of the layer aborts the ones still running.
  refreshes: Arc<Mutex<JoinSet<()>>>,
}

impl<S, N> CacheLayer<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  /// Create a new cache layer over the given storage and network.
  pub fn new(storage: Arc<S>, network: Arc<N>, offline_message: &str) -> Self {
    Self {
      storage,
      network,
      offline_message: Arc::from(offline_message),
      refreshes: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Serve from cache when possible; otherwise fetch and remember.
  ///
  /// 1. Check cache - on a hit, return immediately without touching the network
  /// 2. On a miss, fetch from network and store a copy
  /// 3. Network failure propagates, there is nothing to fall back to
  pub async fn cache_first(
    &self,
    generation: &str,
    request: Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let key = RequestKey::from(&request);

    if let Some(cached) = self.lookup(generation, &key) {
      debug!(url = %request.url, "Serving from cache");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = self.network.fetch(&request).await.inspect_err(|e| {
      warn!(url = %request.url, error = %e, "Network failed, no cache");
    })?;
    remember(self.storage.as_ref(), generation, &key, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Prefer the network; fall back to the cache, then to an offline envelope.
  ///
  /// Never returns an error: an API caller always receives a well-formed
  /// response.
  pub async fn network_first(
    &self,
    generation: &str,
    request: Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let key = RequestKey::from(&request);

    match self.network.fetch(&request).await {
      Ok(response) => {
        remember(self.storage.as_ref(), generation, &key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, trying cache");

        match self.lookup(generation, &key) {
          Some(cached) => Ok(CacheResult::stale(cached.response, cached.cached_at)),
          None => Ok(CacheResult::placeholder(Response::offline_placeholder(
            &self.offline_message,
          ))),
        }
      }
    }
  }

  /// Answer from cache immediately while refreshing it in the background;
  /// wait for the network only on a miss.
  ///
  /// The refresh runs as its own task, so it completes and updates the cache
  /// even when the cached copy has already been returned.
  pub async fn cache_with_fallback(
    &self,
    generation: &str,
    request: Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let key = RequestKey::from(&request);
    let cached = self.lookup(generation, &key);
    let refreshed = self.spawn_refresh(generation, key, request.clone());

    if let Some(cached) = cached {
      debug!(url = %request.url, "Serving from cache, refreshing in background");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    match refreshed.await {
      Ok(Ok(response)) => Ok(CacheResult::from_network(response)),
      Ok(Err(e)) => {
        warn!(url = %request.url, error = %e, "Network failed, no cache");
        Err(e)
      }
      Err(_) => Err(FetchError::Aborted(request.url.to_string())),
    }
  }

  /// Send a request straight to the network without consulting the cache.
  pub async fn bypass(&self, request: Request) -> Result<CacheResult<Response>, FetchError> {
    debug!(method = %request.method, url = %request.url, "Bypassing cache");
    let response = self.network.fetch(&request).await?;
    Ok(CacheResult::bypass(response))
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    let mut pending = {
      let mut refreshes = self
        .refreshes
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      std::mem::take(&mut *refreshes)
    };

    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Background refresh did not complete");
      }
    }
  }

  /// Start a network fetch that stores its result on success.
  /// The receiver yields the network outcome; dropping it leaves the task running.
  fn spawn_refresh(
    &self,
    generation: &str,
    key: RequestKey,
    request: Request,
  ) -> oneshot::Receiver<Result<Response, FetchError>> {
    let (tx, rx) = oneshot::channel();
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let generation = generation.to_string();

    let mut refreshes = self
      .refreshes
      .lock()
      .unwrap_or_else(PoisonError::into_inner);

    // Reap finished refreshes so the set only holds running ones
    while refreshes.try_join_next().is_some() {}

    refreshes.spawn(async move {
      let result = network.fetch(&request).await;
      if let Ok(response) = &result {
        remember(storage.as_ref(), &generation, &key, response);
      }
      // Ignore send errors - the caller may already have answered from cache
      let _ = tx.send(result);
    });

    rx
  }

  /// Cache lookup where a storage fault counts as a miss.
  fn lookup(&self, generation: &str, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.lookup(generation, key) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(url = key.url(), error = %e, "Cache lookup failed, treating as miss");
        None
      }
    }
  }
}

/// Store a copy of a network response. Failures are logged, never raised:
/// the caller still gets the response.
fn remember<S: CacheStorage>(storage: &S, generation: &str, key: &RequestKey, response: &Response) {
  if response.status == PARTIAL_CONTENT {
    debug!(url = key.url(), "Not caching partial response");
    return;
  }

  if let Err(e) = storage.store(generation, key, response) {
    warn!(url = key.url(), error = %e, "Failed to cache response");
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      offline_message: Arc::clone(&self.offline_message),
      refreshes: Arc::clone(&self.refreshes),
    }
  }
}
