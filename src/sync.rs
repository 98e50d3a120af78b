//! Deferred synchronization and control messages.
//!
//! The notifier never touches the application's pending writes; it only
//! tells open contexts that now is a good time to flush them. Replay must be
//! idempotent on the application side since a sync tag can be delivered more
//! than once.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CacheStorage;
use crate::clients::{ClientMessage, ClientRegistry};
use crate::lifecycle::Lifecycle;
use crate::net::Network;

/// Control message sent by an application context.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate the installed generation without waiting
  SkipWaiting,
  /// Any message type this layer does not handle
  #[serde(other)]
  Unknown,
}

/// Relays sync signals to contexts and control messages to the lifecycle.
pub struct SyncNotifier<S: CacheStorage, N: Network> {
  clients: Arc<ClientRegistry>,
  lifecycle: Arc<Lifecycle<S, N>>,
  sync_tag: String,
}

impl<S: CacheStorage, N: Network> SyncNotifier<S, N> {
  pub fn new(clients: Arc<ClientRegistry>, lifecycle: Arc<Lifecycle<S, N>>, sync_tag: &str) -> Self {
    Self {
      clients,
      lifecycle,
      sync_tag: sync_tag.to_string(),
    }
  }

  /// Handle a deferred-synchronization signal.
  ///
  /// For the diary sync tag every controlled context receives one
  /// `SYNC_DIARY_ENTRIES` message. Returns the number of contexts notified.
  pub fn handle_sync(&self, tag: &str) -> usize {
    if tag != self.sync_tag {
      debug!(tag, "Ignoring sync signal");
      return 0;
    }

    let notified = self
      .clients
      .match_all()
      .into_iter()
      .filter(|id| self.clients.post(*id, ClientMessage::SyncDiaryEntries))
      .count();

    info!(tag, notified, "Background sync triggered");
    notified
  }

  /// Handle a control message from a context.
  pub fn handle_message(&self, message: ControlMessage) {
    match message {
      ControlMessage::SkipWaiting => {
        let activated = self.lifecycle.skip_waiting();
        info!(activated, "Skip waiting requested");
      }
      ControlMessage::Unknown => debug!("Ignoring unknown control message"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::config::Config;
  use crate::lifecycle::LifecycleState;
  use crate::net::testing::FakeNetwork;
  use crate::net::Response;

  fn setup(skip_waiting: bool) -> (Arc<ClientRegistry>, Arc<Lifecycle<MemoryStorage, FakeNetwork>>, SyncNotifier<MemoryStorage, FakeNetwork>) {
    let network = FakeNetwork::new();
    network.route("http://app.test/", Response::new(200, "home"));

    let config = Config {
      origin: "http://app.test".to_string(),
      shell_assets: vec!["/".to_string()],
      skip_waiting,
      ..Config::default()
    };
    let clients = Arc::new(ClientRegistry::new());
    let lifecycle = Arc::new(
      Lifecycle::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(network),
        Arc::clone(&clients),
        &config,
      )
      .unwrap(),
    );
    let notifier = SyncNotifier::new(Arc::clone(&clients), Arc::clone(&lifecycle), &config.sync_tag);

    (clients, lifecycle, notifier)
  }

  #[tokio::test]
  async fn test_sync_notifies_each_context_once() {
    let (clients, lifecycle, notifier) = setup(true);
    lifecycle.install().await.unwrap();

    let (_first, mut rx1) = clients.register();
    let (_second, mut rx2) = clients.register();

    assert_eq!(notifier.handle_sync("sync-diary-entries"), 2);

    assert_eq!(rx1.recv().await, Some(ClientMessage::SyncDiaryEntries));
    assert_eq!(rx2.recv().await, Some(ClientMessage::SyncDiaryEntries));
    assert!(rx1.try_recv().is_err());
    assert!(rx2.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_other_tags_are_ignored() {
    let (clients, lifecycle, notifier) = setup(true);
    lifecycle.install().await.unwrap();
    let (_first, mut rx) = clients.register();

    assert_eq!(notifier.handle_sync("sync-goals"), 0);
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_uncontrolled_contexts_are_not_notified() {
    let (clients, _lifecycle, notifier) = setup(true);
    let (_first, mut rx) = clients.register();

    assert_eq!(notifier.handle_sync("sync-diary-entries"), 0);
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates() {
    let (_clients, lifecycle, notifier) = setup(false);
    lifecycle.install().await.unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Installed);

    notifier.handle_message(ControlMessage::SkipWaiting);
    assert_eq!(lifecycle.state(), LifecycleState::Activated);
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let (_clients, lifecycle, notifier) = setup(false);
    lifecycle.install().await.unwrap();

    notifier.handle_message(ControlMessage::Unknown);
    assert_eq!(lifecycle.state(), LifecycleState::Installed);
  }

  #[test]
  fn test_control_message_wire_format() {
    let skip: ControlMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(skip, ControlMessage::SkipWaiting);

    let other: ControlMessage = serde_json::from_str(r#"{"type":"PING","id":3}"#).unwrap();
    assert_eq!(other, ControlMessage::Unknown);
  }
}
