//! Strategy selection and dispatch.

use super::layer::CacheLayer;
use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::net::{FetchError, Network, Request, Response};
use crate::routes::Category;

/// How a GET request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Cache hit wins; the network is only asked on a miss
  CacheFirst,
  /// Network wins; the cache is a last resort
  NetworkFirst,
  /// Cache hit wins, but the network refreshes it in the background
  CacheWithFallback,
}

impl Strategy {
  /// Strategy for a request category.
  pub fn for_category(category: Category) -> Self {
    match category {
      Category::Shell => Self::CacheFirst,
      Category::Api => Self::NetworkFirst,
      Category::Other => Self::CacheWithFallback,
    }
  }

  /// Run this strategy for `request` against `generation` of the cache.
  pub async fn execute<S, N>(
    self,
    layer: &CacheLayer<S, N>,
    generation: &str,
    request: Request,
  ) -> Result<CacheResult<Response>, FetchError>
  where
    S: CacheStorage + 'static,
    N: Network + 'static,
  {
    match self {
      Self::CacheFirst => layer.cache_first(generation, request).await,
      Self::NetworkFirst => layer.network_first(generation, request).await,
      Self::CacheWithFallback => layer.cache_with_fallback(generation, request).await,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::CacheWithFallback => "cache-with-fallback",
    }
  }
}
