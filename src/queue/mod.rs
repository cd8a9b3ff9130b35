//! Offline mutation queue.
//!
//! Writes attempted while offline are persisted here and replayed, oldest
//! first, when the host fires the resource's background-sync tag. Delivery is
//! at-least-once: an item leaves the queue only after the endpoint accepted it.

mod store;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

pub use store::{QueueStore, SqliteQueueStore};

use crate::cache::{system_clock, Clock};
use crate::clients::ClientRegistry;
use crate::http::{FetchError, Network, Request};
use crate::messages::AgentMessage;

/// Resource type tag of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
  Album,
  Photo,
}

impl ResourceType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceType::Album => "album",
      ResourceType::Photo => "photo",
    }
  }

  /// Background-sync tag that flushes this resource type.
  pub fn sync_tag(&self) -> &'static str {
    match self {
      ResourceType::Album => "background-sync-albums",
      ResourceType::Photo => "background-sync-photos",
    }
  }

  pub fn from_sync_tag(tag: &str) -> Option<Self> {
    match tag {
      "background-sync-albums" => Some(ResourceType::Album),
      "background-sync-photos" => Some(ResourceType::Photo),
      _ => None,
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "album" | "albums" => Ok(ResourceType::Album),
      "photo" | "photos" => Ok(ResourceType::Photo),
      other => Err(format!("unknown resource type: {}", other)),
    }
  }
}

/// A write to replay later: where it goes and what it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
  pub method: String,
  pub url: String,
  pub payload: serde_json::Value,
}

impl Mutation {
  pub fn new(method: &str, url: &str, payload: serde_json::Value) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
      payload,
    }
  }
}

/// A mutation as it sits in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
  pub id: i64,
  pub resource: ResourceType,
  pub method: String,
  pub url: String,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
}

/// Number of queued items per resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
  pub albums: usize,
  pub photos: usize,
}

impl QueueCounts {
  pub fn total(&self) -> usize {
    self.albums + self.photos
  }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  /// Ids accepted by the endpoint and removed
  pub replayed: Vec<i64>,
  /// Ids that failed and stay queued, with the error
  pub failed: Vec<(i64, String)>,
}

/// Queue of offline writes with replay against the original endpoints.
pub struct MutationQueue<Q: QueueStore, N: Network> {
  store: Arc<Q>,
  network: Arc<N>,
  clients: ClientRegistry,
  clock: Clock,
  /// One flush at a time per resource type
  album_flush: Mutex<()>,
  photo_flush: Mutex<()>,
}

impl<Q: QueueStore, N: Network> MutationQueue<Q, N> {
  pub fn new(store: Arc<Q>, network: Arc<N>, clients: ClientRegistry) -> Self {
    Self {
      store,
      network,
      clients,
      clock: system_clock(),
      album_flush: Mutex::new(()),
      photo_flush: Mutex::new(()),
    }
  }

  pub fn with_clock(mut self, clock: Clock) -> Self {
    self.clock = clock;
    self
  }

  pub fn enqueue(&self, resource: ResourceType, mutation: &Mutation) -> Result<i64> {
    let id = self.store.insert(resource, mutation, (self.clock)())?;
    info!(id, %resource, url = %mutation.url, "Queued offline mutation");
    Ok(id)
  }

  pub fn pending(&self, resource: ResourceType) -> Result<Vec<QueuedMutation>> {
    self.store.pending(resource)
  }

  pub fn counts(&self) -> Result<QueueCounts> {
    self.store.counts()
  }

  /// Replay every queued item of `resource`, oldest first.
  ///
  /// A failed item stays queued and the loop moves on; there is no backoff.
  /// Each success is broadcast to every client once the item is removed.
  pub async fn flush(&self, resource: ResourceType) -> Result<FlushReport> {
    let _guard = match resource {
      ResourceType::Album => self.album_flush.lock().await,
      ResourceType::Photo => self.photo_flush.lock().await,
    };

    let mut report = FlushReport::default();
    for item in self.store.pending(resource)? {
      // Storage errors only cost this item; the rest are still attempted
      if let Err(e) = self.store.record_attempt(item.id) {
        warn!(id = item.id, %resource, error = %e, "Failed to record attempt, skipping item");
        report.failed.push((item.id, e.to_string()));
        continue;
      }

      match self.replay(&item).await {
        Ok(()) => match self.store.remove(item.id) {
          Ok(true) => {
            let mut done = item;
            done.attempts += 1;
            let id = done.id;
            let delivered = self.clients.broadcast(AgentMessage::synced(done));
            info!(id, %resource, delivered, "Replayed queued mutation");
            report.replayed.push(id);
          }
          Ok(false) => {}
          Err(e) => {
            // Stays queued and will be replayed again
            warn!(id = item.id, %resource, error = %e, "Replayed but failed to dequeue");
            report.failed.push((item.id, e.to_string()));
          }
        },
        Err(e) => {
          let error = e.to_string();
          warn!(id = item.id, %resource, error = %error, "Replay failed, keeping item queued");
          if let Err(e) = self.store.record_failure(item.id, &error) {
            warn!(id = item.id, %resource, error = %e, "Failed to record replay failure");
          }
          report.failed.push((item.id, error));
        }
      }
    }

    Ok(report)
  }

  async fn replay(&self, item: &QueuedMutation) -> Result<(), FetchError> {
    let method = Method::from_bytes(item.method.as_bytes())
      .map_err(|e| FetchError::Network(format!("invalid method {}: {}", item.method, e)))?;
    let url = Url::parse(&item.url)
      .map_err(|e| FetchError::Network(format!("invalid url {}: {}", item.url, e)))?;

    let request = Request::new(method, url).with_json(&item.payload);
    let response = self.network.fetch(&request).await?;
    if response.is_success() {
      Ok(())
    } else {
      Err(FetchError::Status(response.status))
    }
  }
}
