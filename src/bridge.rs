//! Per-tab bridge between a page and the agent.
//!
//! Holds the reactive state a UI renders from (install, connectivity,
//! update, permission, queue counts) and the actions a UI can trigger.
//! State lives in a `watch` channel fed by a pump task that listens to both
//! platform signals and agent events.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::AgentHandle;
use crate::clients::{ClientEvent, ClientId};
use crate::messages::ClientCommand;
use crate::queue::{Mutation, QueueCounts, ResourceType};

/// Rough connection speed, from the platform's effective connection type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionQuality {
  #[default]
  Unknown,
  Slow,
  Fast,
}

impl ConnectionQuality {
  /// Map an effective connection type (`slow-2g`, `2g`, `3g`, `4g`).
  pub fn from_effective_type(effective_type: &str) -> Self {
    match effective_type {
      "slow-2g" | "2g" => ConnectionQuality::Slow,
      "3g" | "4g" => ConnectionQuality::Fast,
      _ => ConnectionQuality::Unknown,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Permission {
  #[default]
  Default,
  Granted,
  Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
  Accepted,
  Dismissed,
  /// No deferred install prompt to show
  Unavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareData {
  pub title: String,
  pub text: Option<String>,
  pub url: Option<String>,
}

/// What a page renders from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeState {
  pub installable: bool,
  pub installed: bool,
  pub online: bool,
  pub connection: ConnectionQuality,
  pub update_available: bool,
  pub notification_permission: Permission,
  pub can_share: bool,
  pub queue: QueueCounts,
}

/// Signals the platform raises on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformSignal {
  /// The platform offered a deferred install prompt
  InstallAvailable,
  AppInstalled,
  Connectivity {
    online: bool,
    quality: ConnectionQuality,
  },
}

/// Page-side platform surface.
#[async_trait]
pub trait HostPlatform: Send + Sync + 'static {
  /// Running as an installed app rather than in a browser tab
  fn is_standalone(&self) -> bool;

  fn is_online(&self) -> bool;

  fn connection_quality(&self) -> ConnectionQuality;

  fn can_share(&self) -> bool;

  fn notification_permission(&self) -> Permission;

  async fn prompt_install(&self) -> InstallOutcome;

  async fn request_notification_permission(&self) -> Permission;

  async fn share(&self, data: &ShareData) -> Result<()>;

  /// Ask the platform to fire `tag` once connectivity returns.
  async fn register_sync(&self, tag: &str) -> Result<()>;

  fn reload(&self);

  fn navigate(&self, url: &str);
}

pub struct ClientBridge<P: HostPlatform> {
  agent: AgentHandle,
  platform: Arc<P>,
  client_id: ClientId,
  state: Arc<watch::Sender<BridgeState>>,
  pump: JoinHandle<()>,
}

impl<P: HostPlatform> ClientBridge<P> {
  /// Register a page open at `url` with the agent and start tracking state.
  pub async fn connect(
    agent: AgentHandle,
    platform: Arc<P>,
    url: &str,
    signals: mpsc::UnboundedReceiver<PlatformSignal>,
  ) -> Result<Self> {
    let connection = agent.connect(url).await?;
    let initial = BridgeState {
      installable: false,
      installed: platform.is_standalone(),
      online: platform.is_online(),
      connection: platform.connection_quality(),
      update_available: false,
      notification_permission: platform.notification_permission(),
      can_share: platform.can_share(),
      queue: agent.queue_counts().await?,
    };
    let (state, _) = watch::channel(initial);
    let state = Arc::new(state);

    let pump = tokio::spawn(pump(
      agent.clone(),
      Arc::clone(&platform),
      Arc::clone(&state),
      connection.events,
      signals,
    ));

    Ok(Self {
      agent,
      platform,
      client_id: connection.id,
      state,
      pump,
    })
  }

  pub fn state(&self) -> BridgeState {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
    self.state.subscribe()
  }

  /// Show the deferred install prompt, if the platform offered one.
  pub async fn prompt_install(&self) -> InstallOutcome {
    if !self.state.borrow().installable {
      return InstallOutcome::Unavailable;
    }

    let outcome = self.platform.prompt_install().await;
    debug!(?outcome, "Install prompt answered");
    // The deferred prompt can only be used once
    self.state.send_modify(|s| s.installable = false);
    outcome
  }

  /// Activate the waiting version and reload onto it.
  pub async fn apply_update(&self) -> Result<()> {
    self.agent.send_command(ClientCommand::SkipWaiting).await?;
    self.state.send_modify(|s| s.update_available = false);
    self.platform.reload();
    Ok(())
  }

  /// Drop every cache partition and reload.
  pub async fn clear_caches(&self) -> Result<()> {
    self.agent.send_command(ClientCommand::ClearCache).await?;
    self.platform.reload();
    Ok(())
  }

  /// Ask for notification permission. A denial is only recorded in state.
  pub async fn request_notification_permission(&self) -> Permission {
    let permission = self.platform.request_notification_permission().await;
    self
      .state
      .send_modify(|s| s.notification_permission = permission);
    permission
  }

  /// Returns false when sharing is unsupported or the share failed.
  pub async fn share(&self, data: ShareData) -> bool {
    if !self.platform.can_share() {
      return false;
    }
    match self.platform.share(&data).await {
      Ok(()) => true,
      Err(e) => {
        debug!(error = %e, "Share did not complete");
        false
      }
    }
  }

  /// Queue a write made while offline and ask for a sync when back online.
  pub async fn enqueue_offline_write(
    &self,
    resource: ResourceType,
    mutation: Mutation,
  ) -> Result<i64> {
    let id = self.agent.enqueue(resource, mutation).await?;
    if let Err(e) = self.platform.register_sync(resource.sync_tag()).await {
      warn!(tag = resource.sync_tag(), error = %e, "Failed to register background sync");
    }
    self.refresh_queue_counts().await?;
    Ok(id)
  }

  pub async fn refresh_queue_counts(&self) -> Result<QueueCounts> {
    refresh_counts(&self.agent, &self.state).await
  }
}

impl<P: HostPlatform> Drop for ClientBridge<P> {
  fn drop(&mut self) {
    self.pump.abort();
    self.agent.disconnect(self.client_id);
  }
}

async fn refresh_counts(
  agent: &AgentHandle,
  state: &watch::Sender<BridgeState>,
) -> Result<QueueCounts> {
  let counts = agent.queue_counts().await?;
  state.send_modify(|s| s.queue = counts);
  Ok(counts)
}

async fn pump<P: HostPlatform>(
  agent: AgentHandle,
  platform: Arc<P>,
  state: Arc<watch::Sender<BridgeState>>,
  mut events: mpsc::UnboundedReceiver<ClientEvent>,
  mut signals: mpsc::UnboundedReceiver<PlatformSignal>,
) {
  let mut signals_open = true;

  loop {
    tokio::select! {
      event = events.recv() => match event {
        Some(event) => handle_event(&agent, platform.as_ref(), &state, event).await,
        None => break,
      },
      signal = signals.recv(), if signals_open => match signal {
        Some(signal) => handle_signal(&state, signal),
        None => signals_open = false,
      },
    }
  }
  debug!("Bridge pump stopped");
}

async fn handle_event<P: HostPlatform>(
  agent: &AgentHandle,
  platform: &P,
  state: &watch::Sender<BridgeState>,
  event: ClientEvent,
) {
  match event {
    ClientEvent::Message(message) => {
      debug!(id = message.item().id, "Queued write synced");
      if let Err(e) = refresh_counts(agent, state).await {
        warn!(error = %e, "Failed to refresh queue counts");
      }
    }
    ClientEvent::UpdateAvailable { version } => {
      debug!(version = %version, "Update available");
      state.send_modify(|s| s.update_available = true);
    }
    ClientEvent::ControllerChanged { version } => {
      debug!(version = %version, "Controller changed");
      state.send_modify(|s| s.update_available = false);
    }
    ClientEvent::Navigate { url } => platform.navigate(&url),
  }
}

fn handle_signal(state: &watch::Sender<BridgeState>, signal: PlatformSignal) {
  state.send_modify(|s| match signal {
    PlatformSignal::InstallAvailable => s.installable = true,
    PlatformSignal::AppInstalled => {
      s.installed = true;
      s.installable = false;
    }
    PlatformSignal::Connectivity { online, quality } => {
      s.online = online;
      s.connection = quality;
    }
  });
}
