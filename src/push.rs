//! Push notifications: payload parsing and click actions.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Fields every notification falls back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  /// Where the `view` action takes the user
  pub view_path: String,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      title: "Waypost".to_string(),
      body: "You have new activity on your journey".to_string(),
      icon: "/icon-192.png".to_string(),
      badge: "/icon-192.png".to_string(),
      tag: "waypost-notification".to_string(),
      view_path: "/dashboard".to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
  View,
  Dismiss,
}

impl NotificationAction {
  pub fn parse(action: &str) -> Option<Self> {
    match action {
      "view" => Some(NotificationAction::View),
      "dismiss" => Some(NotificationAction::Dismiss),
      _ => None,
    }
  }

  pub fn title(&self) -> &'static str {
    match self {
      NotificationAction::View => "View",
      NotificationAction::Dismiss => "Dismiss",
    }
  }
}

/// An action button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionButton {
  pub action: NotificationAction,
  pub title: String,
}

impl From<NotificationAction> for ActionButton {
  fn from(action: NotificationAction) -> Self {
    Self {
      action,
      title: action.title().to_string(),
    }
  }
}

/// A notification ready to be shown by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub actions: Vec<ActionButton>,
}

/// Fields a push payload may override.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  tag: Option<String>,
}

/// Build the notification for an inbound push.
///
/// The payload is optional JSON merged over the defaults; a payload that
/// does not parse as a JSON object is ignored.
pub fn build_notification(payload: Option<&[u8]>, defaults: &NotificationDefaults) -> Notification {
  let overrides = match payload {
    Some(bytes) if !bytes.is_empty() => match serde_json::from_slice::<PushPayload>(bytes) {
      Ok(parsed) => parsed,
      Err(e) => {
        warn!(error = %e, "Malformed push payload, using defaults");
        PushPayload::default()
      }
    },
    _ => PushPayload::default(),
  };

  Notification {
    title: overrides.title.unwrap_or_else(|| defaults.title.clone()),
    body: overrides.body.unwrap_or_else(|| defaults.body.clone()),
    icon: overrides.icon.unwrap_or_else(|| defaults.icon.clone()),
    badge: overrides.badge.unwrap_or_else(|| defaults.badge.clone()),
    tag: overrides.tag.unwrap_or_else(|| defaults.tag.clone()),
    actions: vec![NotificationAction::View.into(), NotificationAction::Dismiss.into()],
  }
}
