use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use waypost::agent::{Agent, AgentHandle, Intercepted};
use waypost::bridge::ClientBridge;
use waypost::cache::{CacheStorage, SqliteStorage};
use waypost::config::Config;
use waypost::db::Database;
use waypost::host::{HeadlessPlatform, LogHost};
use waypost::http::{HttpNetwork, Network, Request};
use waypost::queue::{Mutation, ResourceType};

#[derive(Parser, Debug)]
#[command(name = "waypost")]
#[command(about = "Offline caching and background sync agent for Waypost")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/waypost/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install and activate the configured version
  Install,
  /// Fetch a path through the agent
  Fetch { path: String },
  /// Queue a write for later replay
  Enqueue {
    resource: ResourceType,
    path: String,
    /// JSON payload
    payload: String,
    #[arg(short, long, default_value = "POST")]
    method: String,
  },
  /// Fire a background-sync tag (e.g. background-sync-albums)
  Sync { tag: String },
  /// Show cache partitions and queue counts
  Status,
  /// Delete every cache partition
  Clear,
  /// Deliver a push, with an optional JSON payload
  Push { payload: Option<String> },
  /// Click a shown notification (action: view or dismiss)
  Click {
    #[arg(default_value = "waypost-notification")]
    tag: String,
    #[arg(short, long)]
    action: Option<String>,
  },
  /// Post a raw client message, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
  /// List queued writes for a resource type
  Queue { resource: ResourceType },
}

/// Log to stderr and to a daily file next to the database.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
  // RUST_LOG controls the level (e.g. RUST_LOG=waypost=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let file_appender = tracing_appender::rolling::daily(log_dir, "waypost.log");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(io::stderr))
    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let db_path = match &config.database {
    Some(path) => path.clone(),
    None => Database::default_path()?,
  };
  let log_dir = db_path
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create {}: {}", log_dir.display(), e))?;
  let _guard = init_tracing(&log_dir);

  let db = Arc::new(Database::open(&db_path)?);
  info!(db = %db_path.display(), version = %config.version, "Starting agent");

  let network = Arc::new(HttpNetwork::new()?);
  let handle = Agent::new(
    config.agent_settings(),
    Arc::clone(&db),
    Arc::clone(&network),
    Arc::new(LogHost),
  )
  .spawn();

  match args.command {
    Command::Install => {
      let state = handle.start().await?;
      println!("{} is {:?}", config.version, state);
    }
    Command::Fetch { path } => {
      handle.start().await?;
      let url = config
        .origin
        .join(&path)
        .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
      fetch(&handle, network.as_ref(), Request::get(url)).await?;
    }
    Command::Enqueue {
      resource,
      path,
      payload,
      method,
    } => {
      let url = config
        .origin
        .join(&path)
        .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;

      let (_signals, rx) = mpsc::unbounded_channel();
      let bridge =
        ClientBridge::connect(handle.clone(), Arc::new(HeadlessPlatform), url.as_str(), rx).await?;
      let id = bridge
        .enqueue_offline_write(resource, Mutation::new(&method, url.as_str(), payload))
        .await?;
      let counts = bridge.state().queue;
      println!(
        "Queued {} #{} ({} albums, {} photos pending)",
        resource, id, counts.albums, counts.photos
      );
    }
    Command::Sync { tag } => match handle.sync(&tag).await? {
      Some(report) => {
        println!("Replayed: {:?}", report.replayed);
        for (id, error) in &report.failed {
          println!("Failed #{}: {}", id, error);
        }
      }
      None => println!("Nothing synced for {}", tag),
    },
    Command::Status => {
      let storage = SqliteStorage::new(Arc::clone(&db));
      let mut partitions = storage.partitions()?;
      partitions.sort();
      println!("Version: {}", config.version);
      for name in partitions {
        println!("  {:<24} {} entries", name, storage.entry_count(&name)?);
      }
      let counts = handle.queue_counts().await?;
      println!("Queue: {} albums, {} photos", counts.albums, counts.photos);
    }
    Command::Clear => {
      let (_signals, rx) = mpsc::unbounded_channel();
      let bridge =
        ClientBridge::connect(handle.clone(), Arc::new(HeadlessPlatform), config.origin.as_str(), rx)
          .await?;
      bridge.clear_caches().await?;
      println!("Cleared all cache partitions");
    }
    Command::Push { payload } => {
      let notification = handle.push(payload.map(String::into_bytes)).await?;
      println!("{}", serde_json::to_string_pretty(&notification)?);
    }
    Command::Click { tag, action } => {
      handle.notification_click(&tag, action.as_deref()).await?;
    }
    Command::Message { json } => {
      handle.start().await?;
      handle.post_message(&json).await?;
    }
    Command::Queue { resource } => {
      let pending = handle.pending(resource).await?;
      println!("{}", serde_json::to_string_pretty(&pending)?);
    }
  }

  Ok(())
}

/// Fetch through the agent, going straight to the network when it declines.
async fn fetch<N: Network>(handle: &AgentHandle, network: &N, request: Request) -> Result<()> {
  let url = request.url.clone();
  let (response, source) = match handle.fetch(request.clone()).await? {
    Intercepted::Handled(Ok(routed)) => (routed.response, format!("{:?}", routed.source)),
    Intercepted::Handled(Err(e)) => return Err(eyre!("Failed to fetch {}: {}", url, e)),
    Intercepted::Bypass => {
      let response = network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;
      (response, "Bypass".to_string())
    }
  };

  eprintln!("{} {} ({})", response.status, url, source);
  println!("{}", response.text());
  Ok(())
}
