use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::agent::AgentSettings;
use crate::cache::{system_clock, Retention, TierConfig};
use crate::lifecycle::DEFAULT_PRECACHE;
use crate::push::NotificationDefaults;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the agent serves, e.g. https://waypost.app
  pub origin: Url,
  /// Version token embedded in cache partition names
  #[serde(default = "default_version")]
  pub version: String,
  /// SQLite file (defaults to $XDG_DATA_HOME/waypost/agent.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routing: RoutingConfig,
  #[serde(default)]
  pub precache: PrecacheConfig,
  #[serde(default)]
  pub notifications: NotificationDefaults,
}

fn default_version() -> String {
  "v1".to_string()
}

/// Retention windows, in minutes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub static_minutes: i64,
  pub dynamic_minutes: i64,
  pub image_minutes: i64,
  pub api_minutes: i64,
  /// Unset means partitions grow without bound
  pub max_entries_per_partition: Option<usize>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let retention = Retention::default();
    Self {
      static_minutes: retention.static_assets.num_minutes(),
      dynamic_minutes: retention.dynamic.num_minutes(),
      image_minutes: retention.image.num_minutes(),
      api_minutes: retention.api.num_minutes(),
      max_entries_per_partition: None,
    }
  }
}

impl CacheConfig {
  pub fn retention(&self) -> Retention {
    Retention {
      static_assets: Duration::minutes(self.static_minutes),
      dynamic: Duration::minutes(self.dynamic_minutes),
      image: Duration::minutes(self.image_minutes),
      api: Duration::minutes(self.api_minutes),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Hosts whose requests are treated as API calls
  pub backend_hosts: Vec<String>,
  /// Path prefixes of build-hashed static assets
  pub static_prefixes: Vec<String>,
  /// Section roots a failed navigation may fall back to, in order
  pub app_sections: Vec<String>,
  pub offline_page: String,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      backend_hosts: vec!["supabase.co".to_string()],
      static_prefixes: vec!["/_next/static/".to_string()],
      app_sections: ["/dashboard", "/albums", "/globe", "/profile"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      offline_page: "/offline.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrecacheConfig {
  pub manifest: Vec<String>,
  /// Take over open clients as soon as install finishes
  pub activate_immediately: bool,
}

impl Default for PrecacheConfig {
  fn default() -> Self {
    Self {
      manifest: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
      activate_immediately: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./waypost.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/waypost/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/waypost/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("waypost.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("waypost").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.version.trim().is_empty() {
      return Err(eyre!("`version` must not be empty"));
    }
    Ok(config)
  }

  pub fn tier_config(&self) -> TierConfig {
    TierConfig {
      version: self.version.clone(),
      retention: self.cache.retention(),
      max_entries_per_partition: self.cache.max_entries_per_partition,
    }
  }

  pub fn agent_settings(&self) -> AgentSettings {
    AgentSettings {
      origin: self.origin.clone(),
      tiers: self.tier_config(),
      routing: self.routing.clone(),
      precache: self.precache.manifest.clone(),
      activate_immediately: self.precache.activate_immediately,
      notifications: self.notifications.clone(),
      clock: system_clock(),
    }
  }
}
