//! Wire messages between the agent and its clients.

use serde::{Deserialize, Serialize};

use crate::queue::{QueuedMutation, ResourceType};

/// Agent → client broadcast.
///
/// Serialized as `{ "type": "ALBUM_SYNCED", "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMessage {
  /// A queued album write was accepted by the backend
  AlbumSynced(QueuedMutation),
  /// A queued photo write was accepted by the backend
  PhotoSynced(QueuedMutation),
}

impl AgentMessage {
  /// Completion message for a replayed item, by its resource type.
  pub fn synced(item: QueuedMutation) -> Self {
    match item.resource {
      ResourceType::Album => AgentMessage::AlbumSynced(item),
      ResourceType::Photo => AgentMessage::PhotoSynced(item),
    }
  }

  pub fn item(&self) -> &QueuedMutation {
    match self {
      AgentMessage::AlbumSynced(item) | AgentMessage::PhotoSynced(item) => item,
    }
  }
}

/// Client → agent command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
  /// Activate a waiting version now
  SkipWaiting,
  /// Delete every cache partition
  ClearCache,
}

impl ClientCommand {
  /// Parse a raw message; anything unrecognized yields None.
  pub fn parse(raw: &str) -> Option<Self> {
    serde_json::from_str(raw).ok()
  }
}
