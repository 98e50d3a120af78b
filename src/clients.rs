//! Open application contexts and the messages posted to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

pub type ClientId = u64;

/// Message posted to application contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Flush offline-authored diary entries to the server
  SyncDiaryEntries,
}

struct Client {
  sender: mpsc::UnboundedSender<ClientMessage>,
  /// Generation controlling this context, if any
  controller: Option<String>,
}

#[derive(Default)]
struct Registry {
  clients: BTreeMap<ClientId, Client>,
  /// Generation newly registered contexts are controlled by
  controller: Option<String>,
}

/// Registry of open application contexts.
#[derive(Default)]
pub struct ClientRegistry {
  next_id: AtomicU64,
  inner: Mutex<Registry>,
}

/// Keeps a context registered; dropping it unregisters the context.
pub struct Registration {
  id: ClientId,
  registry: Arc<ClientRegistry>,
}

impl Registration {
  #[allow(dead_code)]
  pub fn id(&self) -> ClientId {
    self.id
  }
}

impl Drop for Registration {
  fn drop(&mut self) {
    self.registry.unregister(self.id);
  }
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  // A poisoned registry is still structurally valid
  fn inner(&self) -> MutexGuard<'_, Registry> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register a new context, returning its registration and message receiver.
  pub fn register(
    self: &Arc<Self>,
  ) -> (Registration, mpsc::UnboundedReceiver<ClientMessage>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);

    let mut inner = self.inner();
    let controller = inner.controller.clone();
    inner.clients.insert(id, Client { sender, controller });
    debug!(client = id, "Context registered");

    let registration = Registration {
      id,
      registry: Arc::clone(self),
    };
    (registration, receiver)
  }

  fn unregister(&self, id: ClientId) {
    if self.inner().clients.remove(&id).is_some() {
      debug!(client = id, "Context unregistered");
    }
  }

  /// Number of open contexts, controlled or not.
  pub fn len(&self) -> usize {
    self.inner().clients.len()
  }

  #[allow(dead_code)]
  pub fn is_empty(&self) -> bool {
    self.inner().clients.is_empty()
  }

  /// Ids of every context controlled by a generation.
  pub fn match_all(&self) -> Vec<ClientId> {
    self
      .inner()
      .clients
      .iter()
      .filter(|(_, client)| client.controller.is_some())
      .map(|(id, _)| *id)
      .collect()
  }

  /// Put every open context, and every later one, under `generation`.
  /// Returns the number of open contexts claimed.
  pub fn claim(&self, generation: &str) -> usize {
    let mut inner = self.inner();
    inner.controller = Some(generation.to_string());

    for client in inner.clients.values_mut() {
      client.controller = Some(generation.to_string());
    }
    inner.clients.len()
  }

  /// Post a message to one context. A context whose receiver is gone is
  /// dropped from the registry.
  pub fn post(&self, id: ClientId, message: ClientMessage) -> bool {
    let mut inner = self.inner();

    let delivered = match inner.clients.get(&id) {
      Some(client) => client.sender.send(message).is_ok(),
      None => return false,
    };
    if !delivered {
      inner.clients.remove(&id);
      debug!(client = id, "Dropped context with closed channel");
    }
    delivered
  }
}
