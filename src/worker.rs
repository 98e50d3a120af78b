//! Wiring of the interception layer's components.

use color_eyre::Result;
use std::sync::Arc;

use crate::cache::{CacheLayer, CacheStorage};
use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::lifecycle::Lifecycle;
use crate::net::{Interceptor, Network};
use crate::routes::RouteClassifier;
use crate::sync::SyncNotifier;

/// All components sharing one cache store and one network.
pub struct Worker<S: CacheStorage, N: Network> {
  pub interceptor: Interceptor<S, N>,
  pub lifecycle: Arc<Lifecycle<S, N>>,
  pub clients: Arc<ClientRegistry>,
  pub notifier: SyncNotifier<S, N>,
  storage: Arc<S>,
}

impl<S, N> Worker<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(config: &Config, storage: S, network: N) -> Result<Self> {
    let storage = Arc::new(storage);
    let network = Arc::new(network);
    let clients = Arc::new(ClientRegistry::new());

    let lifecycle = Arc::new(Lifecycle::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      Arc::clone(&clients),
      config,
    )?);

    let layer = CacheLayer::new(Arc::clone(&storage), network, &config.offline_message);
    let interceptor = Interceptor::new(
      layer,
      RouteClassifier::from_config(&config.routes),
      lifecycle.controlling(),
    );
    let notifier = SyncNotifier::new(
      Arc::clone(&clients),
      Arc::clone(&lifecycle),
      &config.sync_tag,
    );

    Ok(Self {
      interceptor,
      lifecycle,
      clients,
      notifier,
      storage,
    })
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }
}
