//! Hosts for running the agent outside a browser.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use tracing::info;

use crate::agent::AgentHost;
use crate::bridge::{ConnectionQuality, HostPlatform, InstallOutcome, Permission, ShareData};
use crate::push::Notification;

/// Agent host that writes notifications and window requests to the log.
#[derive(Debug, Default)]
pub struct LogHost;

#[async_trait]
impl AgentHost for LogHost {
  async fn show_notification(&self, notification: &Notification) -> Result<()> {
    info!(
      title = %notification.title,
      body = %notification.body,
      tag = %notification.tag,
      "Notification"
    );
    Ok(())
  }

  async fn close_notification(&self, tag: &str) {
    info!(tag, "Notification closed");
  }

  async fn open_window(&self, url: &str) -> Result<()> {
    info!(url, "Open window");
    Ok(())
  }
}

/// Page platform for a terminal: always online, nothing to install or share.
#[derive(Debug, Default)]
pub struct HeadlessPlatform;

#[async_trait]
impl HostPlatform for HeadlessPlatform {
  fn is_standalone(&self) -> bool {
    true
  }

  fn is_online(&self) -> bool {
    true
  }

  fn connection_quality(&self) -> ConnectionQuality {
    ConnectionQuality::Unknown
  }

  fn can_share(&self) -> bool {
    false
  }

  fn notification_permission(&self) -> Permission {
    Permission::Granted
  }

  async fn prompt_install(&self) -> InstallOutcome {
    InstallOutcome::Unavailable
  }

  async fn request_notification_permission(&self) -> Permission {
    Permission::Granted
  }

  async fn share(&self, _data: &ShareData) -> Result<()> {
    Err(eyre!("Sharing is not supported in a terminal"))
  }

  async fn register_sync(&self, tag: &str) -> Result<()> {
    info!(tag, "Run `waypost sync {}` once back online", tag);
    Ok(())
  }

  fn reload(&self) {}

  fn navigate(&self, url: &str) {
    info!(url, "Navigate");
  }
}
