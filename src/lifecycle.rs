//! Installation and activation of a cache generation.
//!
//! A generation moves through `installing → installed → activating →
//! activated`. Install pre-caches the shell assets atomically; activation
//! deletes every other generation and takes control of all open contexts.
//! A failed install leaves the generation `redundant` and the previously
//! active one keeps serving.

use color_eyre::Result;
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::net::{FetchError, Network, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  /// Installed and waiting for permission to activate
  Installed,
  Activating,
  Activated,
  /// Install failed; this generation will never serve
  Redundant,
}

#[derive(Error, Debug)]
pub enum InstallError {
  #[error("Invalid shell asset '{asset}': {reason}")]
  InvalidAsset { asset: String, reason: String },

  #[error("Failed to pre-cache {url}: {source}")]
  Asset {
    url: String,
    #[source]
    source: FetchError,
  },

  #[error("Failed to write shell assets to the cache: {0}")]
  Storage(String),
}

/// Generation whose cache serves intercepted requests.
/// Shared between the lifecycle, which switches it, and the interceptor.
#[derive(Debug, Clone)]
pub struct ActiveGeneration(Arc<RwLock<String>>);

impl ActiveGeneration {
  pub fn new(generation: &str) -> Self {
    Self(Arc::new(RwLock::new(generation.to_string())))
  }

  pub fn get(&self) -> String {
    self
      .0
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn set(&self, generation: &str) {
    *self.0.write().unwrap_or_else(PoisonError::into_inner) = generation.to_string();
  }
}

pub struct Lifecycle<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  clients: Arc<ClientRegistry>,
  generation: String,
  origin: Url,
  shell_assets: Vec<String>,
  skip_waiting_on_install: bool,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
  controlling: ActiveGeneration,
}

impl<S: CacheStorage, N: Network> Lifecycle<S, N> {
  /// Prepare the current generation for install.
  ///
  /// Until it activates, requests keep being served from the generation
  /// recorded as active in storage, if there is one.
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    clients: Arc<ClientRegistry>,
    config: &Config,
  ) -> Result<Self> {
    let origin = config.origin_url()?;

    let previous = storage.active_generation().unwrap_or_else(|e| {
      warn!(error = %e, "Could not read active generation");
      None
    });
    let controlling = match &previous {
      Some(previous) => {
        clients.claim(previous);
        ActiveGeneration::new(previous)
      }
      None => {
        // Nothing active yet: requests before the first activation cache
        // into the current generation
        if let Err(e) = storage.open(&config.generation) {
          warn!(generation = %config.generation, error = %e, "Could not open cache generation");
        }
        ActiveGeneration::new(&config.generation)
      }
    };

    Ok(Self {
      storage,
      network,
      clients,
      generation: config.generation.clone(),
      origin,
      shell_assets: config.shell_assets.clone(),
      skip_waiting_on_install: config.skip_waiting,
      state: Mutex::new(LifecycleState::Installing),
      skip_waiting: AtomicBool::new(false),
      controlling,
    })
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, state: LifecycleState) {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }

  /// Handle to the generation currently serving requests.
  pub fn controlling(&self) -> ActiveGeneration {
    self.controlling.clone()
  }

  /// Pre-cache every shell asset into the current generation.
  ///
  /// All assets are fetched before anything is written; a single failure
  /// aborts the install with the cache untouched. On success the generation
  /// activates immediately unless configured to wait.
  pub async fn install(&self) -> Result<(), InstallError> {
    self.set_state(LifecycleState::Installing);
    info!(generation = %self.generation, assets = self.shell_assets.len(), "Installing");

    match self.precache().await {
      Ok(entries) => {
        info!(generation = %self.generation, cached = entries, "Shell assets cached");
        self.set_state(LifecycleState::Installed);
      }
      Err(e) => {
        error!(generation = %self.generation, error = %e, "Install failed");
        self.set_state(LifecycleState::Redundant);
        return Err(e);
      }
    }

    if self.skip_waiting_on_install {
      self.skip_waiting.store(true, Ordering::SeqCst);
    }
    if self.skip_waiting.load(Ordering::SeqCst) {
      self.activate();
    } else {
      info!(generation = %self.generation, "Installed, waiting to activate");
    }

    Ok(())
  }

  async fn precache(&self) -> Result<usize, InstallError> {
    if let Err(e) = self.storage.open(&self.generation) {
      return Err(InstallError::Storage(e.to_string()));
    }

    let requests = self
      .shell_assets
      .iter()
      .map(|asset| {
        self
          .origin
          .join(asset)
          .map(Request::get)
          .map_err(|e| InstallError::InvalidAsset {
            asset: asset.clone(),
            reason: e.to_string(),
          })
      })
      .collect::<Result<Vec<_>, _>>()?;

    let entries = try_join_all(requests.into_iter().map(|request| self.fetch_asset(request))).await?;

    self
      .storage
      .store_all(&self.generation, &entries)
      .map_err(|e| InstallError::Storage(e.to_string()))?;

    Ok(entries.len())
  }

  async fn fetch_asset(&self, request: Request) -> Result<(RequestKey, Response), InstallError> {
    let url = request.url.to_string();

    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|source| InstallError::Asset {
        url: url.clone(),
        source,
      })?;

    if !response.is_success() {
      return Err(InstallError::Asset {
        url: url.clone(),
        source: FetchError::Status {
          status: response.status,
          url,
        },
      });
    }

    debug!(url = %url, "Pre-cached shell asset");
    Ok((RequestKey::from(&request), response))
  }

  /// Stop waiting and activate as soon as the install has finished.
  /// Returns whether activation happened now.
  pub fn skip_waiting(&self) -> bool {
    self.skip_waiting.store(true, Ordering::SeqCst);
    self.activate()
  }

  /// Retire every other generation and take control of all contexts.
  ///
  /// Only an installed generation activates; otherwise this is a no-op.
  /// Deleting old generations is best-effort. Returns whether activation
  /// happened.
  pub fn activate(&self) -> bool {
    {
      let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      let current = *state;
      if current != LifecycleState::Installed {
        debug!(generation = %self.generation, state = ?current, "Not ready to activate");
        return false;
      }
      *state = LifecycleState::Activating;
    }
    info!(generation = %self.generation, "Activating");

    // Switch before deleting; writes still in flight for an old generation
    // fail once it is gone
    self.controlling.set(&self.generation);
    if let Err(e) = self.storage.set_active_generation(&self.generation) {
      warn!(generation = %self.generation, error = %e, "Failed to record active generation");
    }

    let stale = match self.storage.generations() {
      Ok(generations) => generations
        .into_iter()
        .filter(|name| name != &self.generation)
        .collect(),
      Err(e) => {
        warn!(error = %e, "Could not list cache generations");
        Vec::new()
      }
    };

    for name in stale {
      match self.storage.delete_generation(&name) {
        Ok(_) => info!(generation = %name, "Deleted old cache"),
        Err(e) => warn!(generation = %name, error = %e, "Failed to delete old cache"),
      }
    }

    let claimed = self.clients.claim(&self.generation);
    self.set_state(LifecycleState::Activated);
    info!(generation = %self.generation, claimed, "Activated");

    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::net::testing::FakeNetwork;

  const ORIGIN: &str = "http://app.test";

  fn config(generation: &str, assets: &[&str]) -> Config {
    Config {
      origin: ORIGIN.to_string(),
      generation: generation.to_string(),
      shell_assets: assets.iter().map(|s| s.to_string()).collect(),
      ..Config::default()
    }
  }

  fn key(url: &str) -> RequestKey {
    RequestKey::from(&Request::get(Url::parse(url).unwrap()))
  }

  struct Fixture {
    storage: Arc<MemoryStorage>,
    network: Arc<FakeNetwork>,
    clients: Arc<ClientRegistry>,
  }

  impl Fixture {
    fn new() -> Self {
      let network = FakeNetwork::new();
      for path in ["/", "/dashboard/", "/static/app.css"] {
        network.route(&format!("{}{}", ORIGIN, path), Response::new(200, path));
      }
      network.route(
        "https://cdn.example.com/bootstrap.css",
        Response::new(200, "bootstrap"),
      );

      Self {
        storage: Arc::new(MemoryStorage::new()),
        network: Arc::new(network),
        clients: Arc::new(ClientRegistry::new()),
      }
    }

    fn lifecycle(&self, config: &Config) -> Lifecycle<MemoryStorage, FakeNetwork> {
      Lifecycle::new(
        Arc::clone(&self.storage),
        Arc::clone(&self.network),
        Arc::clone(&self.clients),
        config,
      )
      .unwrap()
    }
  }

  #[tokio::test]
  async fn test_install_precaches_and_activates() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle(&config(
      "v1",
      &["/", "/dashboard/", "https://cdn.example.com/bootstrap.css"],
    ));

    lifecycle.install().await.unwrap();

    assert_eq!(lifecycle.state(), LifecycleState::Activated);
    assert_eq!(lifecycle.controlling().get(), "v1");
    let cached = fixture
      .storage
      .lookup("v1", &key("https://cdn.example.com/bootstrap.css"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"bootstrap".to_vec());
    assert!(fixture
      .storage
      .lookup("v1", &key("http://app.test/dashboard/"))
      .unwrap()
      .is_some());
    assert_eq!(
      fixture.storage.active_generation().unwrap().as_deref(),
      Some("v1")
    );
  }

  #[tokio::test]
  async fn test_activation_deletes_other_generations() {
    let fixture = Fixture::new();
    let old = Response::new(200, "old");
    fixture.storage.open("v0").unwrap();
    fixture.storage.open("scratch").unwrap();
    fixture
      .storage
      .store("v0", &key("http://app.test/"), &old)
      .unwrap();
    fixture
      .storage
      .store("scratch", &key("http://app.test/"), &old)
      .unwrap();
    fixture.storage.set_active_generation("v0").unwrap();

    let lifecycle = fixture.lifecycle(&config("v1", &["/"]));
    assert_eq!(lifecycle.controlling().get(), "v0");

    lifecycle.install().await.unwrap();

    assert_eq!(fixture.storage.generations().unwrap(), vec!["v1".to_string()]);
    assert!(fixture
      .storage
      .lookup("v0", &key("http://app.test/"))
      .unwrap()
      .is_none());
    assert_eq!(lifecycle.controlling().get(), "v1");
  }

  #[tokio::test]
  async fn test_failed_asset_aborts_install() {
    let fixture = Fixture::new();
    fixture.storage.open("v0").unwrap();
    fixture
      .storage
      .store("v0", &key("http://app.test/"), &Response::new(200, "old"))
      .unwrap();
    fixture.storage.set_active_generation("v0").unwrap();

    // "/missing.js" answers 404, which fails the install like a network error
    let lifecycle = fixture.lifecycle(&config("v1", &["/", "/dashboard/", "/missing.js"]));
    let result = lifecycle.install().await;

    assert!(matches!(
      result,
      Err(InstallError::Asset {
        source: FetchError::Status { status: 404, .. },
        ..
      })
    ));
    assert_eq!(lifecycle.state(), LifecycleState::Redundant);
    assert!(fixture
      .storage
      .lookup("v1", &key("http://app.test/"))
      .unwrap()
      .is_none());
    assert!(fixture
      .storage
      .lookup("v1", &key("http://app.test/dashboard/"))
      .unwrap()
      .is_none());

    // The previous generation keeps serving
    assert_eq!(lifecycle.controlling().get(), "v0");
    assert_eq!(
      fixture.storage.active_generation().unwrap().as_deref(),
      Some("v0")
    );
    assert!(fixture
      .storage
      .lookup("v0", &key("http://app.test/"))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_offline_install_fails() {
    let fixture = Fixture::new();
    fixture.network.set_online(false);
    let lifecycle = fixture.lifecycle(&config("v1", &["/"]));

    let result = lifecycle.install().await;

    assert!(matches!(
      result,
      Err(InstallError::Asset {
        source: FetchError::Unreachable(_),
        ..
      })
    ));
    assert!(!lifecycle.activate());
  }

  #[tokio::test]
  async fn test_waits_for_skip_waiting_when_configured() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle(&Config {
      skip_waiting: false,
      ..config("v1", &["/"])
    });

    lifecycle.install().await.unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Installed);

    assert!(lifecycle.skip_waiting());
    assert_eq!(lifecycle.state(), LifecycleState::Activated);

    // A second request has nothing left to do
    assert!(!lifecycle.skip_waiting());
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_completes() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle(&Config {
      skip_waiting: false,
      ..config("v1", &["/"])
    });

    // Requested early; honoured once the install finishes
    assert!(!lifecycle.skip_waiting());
    lifecycle.install().await.unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Activated);
  }

  #[tokio::test]
  async fn test_activation_claims_open_contexts() {
    let fixture = Fixture::new();
    let (_first, _rx1) = fixture.clients.register();
    let (_second, _rx2) = fixture.clients.register();
    assert!(fixture.clients.match_all().is_empty());

    let lifecycle = fixture.lifecycle(&config("v1", &["/"]));
    lifecycle.install().await.unwrap();

    assert_eq!(fixture.clients.match_all().len(), 2);
  }

  #[test]
  fn test_invalid_origin_is_rejected() {
    let fixture = Fixture::new();
    let result = Lifecycle::new(
      Arc::clone(&fixture.storage),
      Arc::clone(&fixture.network),
      Arc::clone(&fixture.clients),
      &Config {
        origin: "not a url".to_string(),
        ..Config::default()
      },
    );
    assert!(result.is_err());
  }
}
