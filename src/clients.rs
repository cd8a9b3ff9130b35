//! Registry of open clients (tabs/windows) the agent can address.
//!
//! Every send is fire-and-forget: the agent never waits for a client to read
//! its channel, and clients whose receiver is gone are pruned on the next send.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messages::AgentMessage;

pub type ClientId = u64;

/// Events delivered to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
  /// Broadcast from the agent
  Message(AgentMessage),
  /// A new version finished installing and waits for activation
  UpdateAvailable { version: String },
  /// The client is now controlled by this version
  ControllerChanged { version: String },
  /// The client should show this URL
  Navigate { url: String },
}

/// A client's end of the registration.
#[derive(Debug)]
pub struct ClientConnection {
  pub id: ClientId,
  pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

struct ClientSlot {
  url: String,
  controller: Option<String>,
  sender: mpsc::UnboundedSender<ClientEvent>,
}

/// Clone is cheap - all clones share the same registry.
#[derive(Clone, Default)]
pub struct ClientRegistry {
  clients: Arc<Mutex<BTreeMap<ClientId, ClientSlot>>>,
  next_id: Arc<AtomicU64>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<ClientId, ClientSlot>> {
    match self.clients.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        warn!("Recovered from poisoned client registry lock");
        poisoned.into_inner()
      }
    }
  }

  /// Register a client open at `url`. Clients start uncontrolled.
  pub fn register(&self, url: &str) -> ClientConnection {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (sender, events) = mpsc::unbounded_channel();
    self.lock().insert(
      id,
      ClientSlot {
        url: url.to_string(),
        controller: None,
        sender,
      },
    );
    debug!(id, url, "Client registered");
    ClientConnection { id, events }
  }

  pub fn unregister(&self, id: ClientId) {
    self.lock().remove(&id);
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  /// Version controlling a client, if it has been claimed.
  pub fn controller(&self, id: ClientId) -> Option<String> {
    self.lock().get(&id).and_then(|slot| slot.controller.clone())
  }

  /// Send a message to every client. Returns how many were reached.
  pub fn broadcast(&self, message: AgentMessage) -> usize {
    self.notify_all(ClientEvent::Message(message))
  }

  /// Send an event to every client, dropping the ones that went away.
  pub fn notify_all(&self, event: ClientEvent) -> usize {
    let mut clients = self.lock();
    clients.retain(|_, slot| slot.sender.send(event.clone()).is_ok());
    clients.len()
  }

  /// Take control of every open client for `version`.
  pub fn claim(&self, version: &str) -> usize {
    let mut clients = self.lock();
    clients.retain(|_, slot| {
      slot.controller = Some(version.to_string());
      slot
        .sender
        .send(ClientEvent::ControllerChanged {
          version: version.to_string(),
        })
        .is_ok()
    });
    clients.len()
  }

  /// Point an open client at `url`, preferring one already there.
  /// Returns false when no client is open.
  pub fn focus_or_navigate(&self, url: &str) -> bool {
    let mut clients = self.lock();
    clients.retain(|_, slot| !slot.sender.is_closed());

    let target = clients
      .iter()
      .find(|(_, slot)| slot.url == url)
      .or_else(|| clients.iter().next())
      .map(|(id, _)| *id);

    match target.and_then(|id| clients.get_mut(&id)) {
      Some(slot) => {
        slot.url = url.to_string();
        slot
          .sender
          .send(ClientEvent::Navigate {
            url: url.to_string(),
          })
          .is_ok()
      }
      None => false,
    }
  }
}
