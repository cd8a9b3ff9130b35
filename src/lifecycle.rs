//! Agent lifecycle: install, activate, version migration.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheTiers, Purpose};
use crate::clients::ClientRegistry;
use crate::http::{Network, Request};

/// Paths written to the static partition on install.
pub const DEFAULT_PRECACHE: &[&str] = &[
  "/",
  "/offline.html",
  "/api/manifest",
  "/icon-192.png",
  "/icon-512.png",
  "/manifest.json",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Created, nothing run yet
  Parsed,
  Installing,
  /// Installed, waiting for permission to take over
  Waiting,
  Activating,
  Activated,
  /// Install failed; this version will never activate
  Redundant,
}

/// What activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
  pub removed_partitions: Vec<String>,
  pub claimed_clients: usize,
}

pub struct LifecycleCoordinator<S: CacheStorage, N: Network> {
  tiers: Arc<CacheTiers<S>>,
  network: Arc<N>,
  clients: ClientRegistry,
  origin: Url,
  precache: Vec<String>,
  activate_immediately: bool,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
}

impl<S: CacheStorage, N: Network> LifecycleCoordinator<S, N> {
  pub fn new(
    tiers: Arc<CacheTiers<S>>,
    network: Arc<N>,
    clients: ClientRegistry,
    origin: Url,
    precache: Vec<String>,
  ) -> Self {
    Self {
      tiers,
      network,
      clients,
      origin,
      precache,
      activate_immediately: true,
      state: Mutex::new(LifecycleState::Parsed),
      skip_waiting: AtomicBool::new(false),
    }
  }

  /// Keep a freshly installed version waiting until told to skip waiting.
  pub fn with_activate_immediately(mut self, activate_immediately: bool) -> Self {
    self.activate_immediately = activate_immediately;
    self
  }

  pub fn version(&self) -> &str {
    self.tiers.version()
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  pub fn is_active(&self) -> bool {
    self.state() == LifecycleState::Activated
  }

  /// Whether this version was installed by an earlier run of the agent.
  pub fn is_installed(&self) -> Result<bool> {
    self.tiers.has_partition(Purpose::Static)
  }

  /// Fetch the precache manifest and seed the static partition.
  ///
  /// All-or-nothing: if any resource fails or answers non-2xx, nothing is
  /// stored and the version becomes redundant. A storage error while seeding
  /// drops the static partition again.
  pub async fn install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing);
    info!(version = self.version(), "Installing agent");

    match self.precache().await {
      Ok(count) => {
        info!(version = self.version(), count, "Precached static resources");
        self.set_state(LifecycleState::Waiting);
        if self.activate_immediately {
          self.skip_waiting();
        }
        Ok(())
      }
      Err(e) => {
        warn!(version = self.version(), error = %e, "Install failed");
        self.set_state(LifecycleState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let requests = self
      .precache
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid precache path {}: {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = self
        .network
        .fetch(request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>(response)
    }))
    .await?;

    self.tiers.open_current()?;
    let seeded = requests
      .iter()
      .zip(&responses)
      .try_for_each(|(request, response)| self.tiers.put(Purpose::Static, &request.key(), response));

    if let Err(e) = seeded {
      // Leave no partly seeded partition behind
      if let Err(cleanup) = self.tiers.drop_partition(Purpose::Static) {
        warn!(error = %cleanup, "Failed to drop partly seeded static partition");
      }
      return Err(e);
    }

    Ok(responses.len())
  }

  /// Ask to activate without waiting for existing clients to close.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Installed and allowed to take over.
  pub fn ready_to_activate(&self) -> bool {
    self.state() == LifecycleState::Waiting && self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Sweep other versions' partitions, then claim every open client.
  pub fn activate(&self) -> Result<Activation> {
    self.set_state(LifecycleState::Activating);

    let removed_partitions = match self.tiers.sweep_stale_versions() {
      Ok(removed) => removed,
      Err(e) => {
        // Stay waiting so a later attempt can retry the sweep
        self.set_state(LifecycleState::Waiting);
        return Err(e);
      }
    };
    self.tiers.open_current()?;

    let claimed_clients = self.clients.claim(self.version());
    self.set_state(LifecycleState::Activated);
    info!(
      version = self.version(),
      removed = removed_partitions.len(),
      claimed_clients,
      "Agent activated"
    );

    Ok(Activation {
      removed_partitions,
      claimed_clients,
    })
  }

  /// Bring the agent up after a restart: install if this version never
  /// was, otherwise go straight to activation.
  pub async fn start(&self) -> Result<LifecycleState> {
    if self.is_installed()? {
      info!(version = self.version(), "Version already installed, resuming");
      self.set_state(LifecycleState::Waiting);
      self.skip_waiting();
    } else {
      self.install().await?;
    }

    if self.ready_to_activate() {
      self.activate()?;
    }
    Ok(self.state())
  }
}
