//! The background agent.
//!
//! A single long-lived task that owns the cache tiers, the router, the
//! mutation queue and the lifecycle. Pages never touch those directly: they
//! hold an [`AgentHandle`] and talk to the agent over a channel. Every event
//! is handled on its own task, so intercepted requests run their strategy
//! pipelines concurrently.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{system_clock, CacheTiers, Clock, SqliteStorage, TierConfig};
use crate::clients::{ClientConnection, ClientEvent, ClientId, ClientRegistry};
use crate::config::RoutingConfig;
use crate::db::Database;
use crate::http::{FetchError, Network, Request};
use crate::lifecycle::{LifecycleCoordinator, LifecycleState, DEFAULT_PRECACHE};
use crate::messages::ClientCommand;
use crate::push::{build_notification, Notification, NotificationAction, NotificationDefaults};
use crate::queue::{
  FlushReport, Mutation, MutationQueue, QueueCounts, QueuedMutation, ResourceType,
  SqliteQueueStore,
};
use crate::router::{should_intercept, Classifier, NavigationFallbacks, Routed, Router};

/// Agent-side platform surface.
#[async_trait]
pub trait AgentHost: Send + Sync + 'static {
  async fn show_notification(&self, notification: &Notification) -> Result<()>;

  async fn close_notification(&self, tag: &str);

  /// Open a new window at `url`; used when no client can be focused.
  async fn open_window(&self, url: &str) -> Result<()>;
}

/// Everything the agent needs to know at construction time.
pub struct AgentSettings {
  pub origin: Url,
  pub tiers: TierConfig,
  pub routing: RoutingConfig,
  pub precache: Vec<String>,
  pub activate_immediately: bool,
  pub notifications: NotificationDefaults,
  pub clock: Clock,
}

impl AgentSettings {
  /// Settings with every default, for `origin` at `version`.
  pub fn new(origin: Url, version: &str) -> Self {
    Self {
      origin,
      tiers: TierConfig::new(version),
      routing: RoutingConfig::default(),
      precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
      activate_immediately: true,
      notifications: NotificationDefaults::default(),
      clock: system_clock(),
    }
  }
}

/// Outcome of handing a request to the agent.
#[derive(Debug)]
pub enum Intercepted {
  /// Not ours: non-GET, non-http(s), or the agent is not active yet
  Bypass,
  Handled(Result<Routed, FetchError>),
}

enum AgentEvent {
  Start {
    reply: oneshot::Sender<Result<LifecycleState>>,
  },
  Fetch {
    request: Request,
    reply: oneshot::Sender<Intercepted>,
  },
  Sync {
    tag: String,
    reply: oneshot::Sender<Option<FlushReport>>,
  },
  Push {
    payload: Option<Vec<u8>>,
    reply: oneshot::Sender<Notification>,
  },
  NotificationClick {
    tag: String,
    action: Option<String>,
    reply: oneshot::Sender<()>,
  },
  Command {
    command: ClientCommand,
    reply: oneshot::Sender<()>,
  },
  Enqueue {
    resource: ResourceType,
    mutation: Mutation,
    reply: oneshot::Sender<Result<i64>>,
  },
  Pending {
    resource: ResourceType,
    reply: oneshot::Sender<Result<Vec<QueuedMutation>>>,
  },
  QueueCounts {
    reply: oneshot::Sender<Result<QueueCounts>>,
  },
  Connect {
    url: String,
    reply: oneshot::Sender<ClientConnection>,
  },
  Disconnect {
    id: ClientId,
  },
}

pub struct Agent<N: Network, H: AgentHost> {
  origin: Url,
  tiers: Arc<CacheTiers<SqliteStorage>>,
  router: Router<SqliteStorage, N>,
  queue: MutationQueue<SqliteQueueStore, N>,
  lifecycle: LifecycleCoordinator<SqliteStorage, N>,
  clients: ClientRegistry,
  host: Arc<H>,
  notifications: NotificationDefaults,
}

impl<N: Network, H: AgentHost> Agent<N, H> {
  pub fn new(settings: AgentSettings, db: Arc<Database>, network: Arc<N>, host: Arc<H>) -> Self {
    let clients = ClientRegistry::new();

    let tiers = Arc::new(
      CacheTiers::new(
        Arc::new(SqliteStorage::new(Arc::clone(&db))),
        settings.tiers,
      )
      .with_clock(Arc::clone(&settings.clock)),
    );

    let router = Router::new(
      Arc::clone(&tiers),
      Arc::clone(&network),
      Classifier::new(
        settings.routing.backend_hosts.clone(),
        settings.routing.static_prefixes.clone(),
      ),
      NavigationFallbacks {
        app_sections: settings.routing.app_sections.clone(),
        offline_page: settings.routing.offline_page.clone(),
      },
    );

    let queue = MutationQueue::new(
      Arc::new(SqliteQueueStore::new(db)),
      Arc::clone(&network),
      clients.clone(),
    )
    .with_clock(settings.clock);

    let lifecycle = LifecycleCoordinator::new(
      Arc::clone(&tiers),
      network,
      clients.clone(),
      settings.origin.clone(),
      settings.precache,
    )
    .with_activate_immediately(settings.activate_immediately);

    Self {
      origin: settings.origin,
      tiers,
      router,
      queue,
      lifecycle,
      clients,
      host,
      notifications: settings.notifications,
    }
  }

  /// Move the agent onto its own task and return the handle pages use.
  pub fn spawn(self) -> AgentHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(Arc::new(self).run(rx));
    AgentHandle { tx }
  }

  async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
      let agent = Arc::clone(&self);
      tokio::spawn(async move { agent.dispatch(event).await });
    }
    debug!("Agent channel closed, stopping");
  }

  async fn dispatch(&self, event: AgentEvent) {
    // Replies are best-effort: a caller that went away just misses the answer
    match event {
      AgentEvent::Start { reply } => {
        let _ = reply.send(self.start().await);
      }
      AgentEvent::Fetch { request, reply } => {
        let _ = reply.send(self.intercept(request).await);
      }
      AgentEvent::Sync { tag, reply } => {
        let _ = reply.send(self.sync(&tag).await);
      }
      AgentEvent::Push { payload, reply } => {
        let _ = reply.send(self.push(payload.as_deref()).await);
      }
      AgentEvent::NotificationClick { tag, action, reply } => {
        self.notification_click(&tag, action.as_deref()).await;
        let _ = reply.send(());
      }
      AgentEvent::Command { command, reply } => {
        self.command(command);
        let _ = reply.send(());
      }
      AgentEvent::Enqueue {
        resource,
        mutation,
        reply,
      } => {
        let _ = reply.send(self.queue.enqueue(resource, &mutation));
      }
      AgentEvent::Pending { resource, reply } => {
        let _ = reply.send(self.queue.pending(resource));
      }
      AgentEvent::QueueCounts { reply } => {
        let _ = reply.send(self.queue.counts());
      }
      AgentEvent::Connect { url, reply } => {
        let _ = reply.send(self.clients.register(&url));
      }
      AgentEvent::Disconnect { id } => self.clients.unregister(id),
    }
  }

  async fn start(&self) -> Result<LifecycleState> {
    let state = self.lifecycle.start().await?;
    if state == LifecycleState::Waiting {
      self.clients.notify_all(ClientEvent::UpdateAvailable {
        version: self.lifecycle.version().to_string(),
      });
    }
    Ok(state)
  }

  async fn intercept(&self, request: Request) -> Intercepted {
    if !should_intercept(&request) || !self.lifecycle.is_active() {
      return Intercepted::Bypass;
    }
    Intercepted::Handled(self.router.handle(&request).await)
  }

  async fn sync(&self, tag: &str) -> Option<FlushReport> {
    let Some(resource) = ResourceType::from_sync_tag(tag) else {
      warn!(tag, "Ignoring unknown sync tag");
      return None;
    };

    match self.queue.flush(resource).await {
      Ok(report) => {
        info!(
          tag,
          replayed = report.replayed.len(),
          failed = report.failed.len(),
          "Background sync finished"
        );
        Some(report)
      }
      Err(e) => {
        warn!(tag, error = %e, "Background sync failed");
        None
      }
    }
  }

  async fn push(&self, payload: Option<&[u8]>) -> Notification {
    let notification = build_notification(payload, &self.notifications);
    if let Err(e) = self.host.show_notification(&notification).await {
      warn!(error = %e, "Failed to show notification");
    }
    notification
  }

  async fn notification_click(&self, tag: &str, action: Option<&str>) {
    self.host.close_notification(tag).await;

    // A click on the body carries no action and behaves like "view"
    let open = match action {
      None => true,
      Some(action) => NotificationAction::parse(action) == Some(NotificationAction::View),
    };
    if !open {
      return;
    }

    let url = match self.origin.join(&self.notifications.view_path) {
      Ok(url) => url,
      Err(e) => {
        warn!(path = %self.notifications.view_path, error = %e, "Invalid notification target");
        return;
      }
    };
    if !self.clients.focus_or_navigate(url.as_str()) {
      if let Err(e) = self.host.open_window(url.as_str()).await {
        warn!(url = %url, error = %e, "Failed to open window");
      }
    }
  }

  fn command(&self, command: ClientCommand) {
    debug!(?command, "Client command");
    match command {
      ClientCommand::SkipWaiting => {
        self.lifecycle.skip_waiting();
        if self.lifecycle.ready_to_activate() {
          if let Err(e) = self.lifecycle.activate() {
            warn!(error = %e, "Activation failed");
          }
        }
      }
      ClientCommand::ClearCache => {
        if let Err(e) = self.tiers.clear_all() {
          warn!(error = %e, "Failed to clear caches");
        }
      }
    }
  }
}

/// Page-side handle to a running agent. Clone is cheap.
#[derive(Clone)]
pub struct AgentHandle {
  tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentHandle {
  async fn request<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> AgentEvent) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(event(reply))
      .map_err(|_| eyre!("Agent is not running"))?;
    rx.await.map_err(|_| eyre!("Agent dropped the request"))
  }

  /// Install (or resume) and activate the agent's version.
  pub async fn start(&self) -> Result<LifecycleState> {
    self.request(|reply| AgentEvent::Start { reply }).await?
  }

  pub async fn fetch(&self, request: Request) -> Result<Intercepted> {
    self
      .request(|reply| AgentEvent::Fetch { request, reply })
      .await
  }

  /// Fire a background-sync tag. None when the tag is unknown or the flush failed.
  pub async fn sync(&self, tag: &str) -> Result<Option<FlushReport>> {
    self
      .request(|reply| AgentEvent::Sync {
        tag: tag.to_string(),
        reply,
      })
      .await
  }

  pub async fn push(&self, payload: Option<Vec<u8>>) -> Result<Notification> {
    self
      .request(|reply| AgentEvent::Push { payload, reply })
      .await
  }

  pub async fn notification_click(&self, tag: &str, action: Option<&str>) -> Result<()> {
    self
      .request(|reply| AgentEvent::NotificationClick {
        tag: tag.to_string(),
        action: action.map(String::from),
        reply,
      })
      .await
  }

  /// Resolves once the agent has acted on the command.
  pub async fn send_command(&self, command: ClientCommand) -> Result<()> {
    self
      .request(|reply| AgentEvent::Command { command, reply })
      .await
  }

  /// Deliver a raw JSON message; unrecognized messages are dropped.
  pub async fn post_message(&self, raw: &str) -> Result<()> {
    match ClientCommand::parse(raw) {
      Some(command) => self.send_command(command).await,
      None => {
        warn!(message = raw, "Ignoring unrecognized client message");
        Ok(())
      }
    }
  }

  pub async fn enqueue(&self, resource: ResourceType, mutation: Mutation) -> Result<i64> {
    self
      .request(|reply| AgentEvent::Enqueue {
        resource,
        mutation,
        reply,
      })
      .await?
  }

  pub async fn pending(&self, resource: ResourceType) -> Result<Vec<QueuedMutation>> {
    self
      .request(|reply| AgentEvent::Pending { resource, reply })
      .await?
  }

  pub async fn queue_counts(&self) -> Result<QueueCounts> {
    self
      .request(|reply| AgentEvent::QueueCounts { reply })
      .await?
  }

  /// Register a client open at `url`.
  pub async fn connect(&self, url: &str) -> Result<ClientConnection> {
    self
      .request(|reply| AgentEvent::Connect {
        url: url.to_string(),
        reply,
      })
      .await
  }

  pub fn disconnect(&self, id: ClientId) {
    let _ = self.tx.send(AgentEvent::Disconnect { id });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::messages::AgentMessage;
  use crate::router::RouteSource;
  use crate::testing::{FakeNetwork, ManualClock, RecordingHost};
  use reqwest::Method;
  use serde_json::json;

  const ORIGIN: &str = "https://waypost.app";

  struct Fixture {
    handle: AgentHandle,
    network: Arc<FakeNetwork>,
    host: Arc<RecordingHost>,
    clock: ManualClock,
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn fixture_with(db: Arc<Database>, version: &str) -> Fixture {
    let network = Arc::new(FakeNetwork::new());
    for path in DEFAULT_PRECACHE {
      network.respond(url(path).as_str(), Response::new(200, format!("static {}", path)));
    }
    let host = Arc::new(RecordingHost::default());
    let clock = ManualClock::new();
    let mut settings = AgentSettings::new(Url::parse(ORIGIN).unwrap(), version);
    settings.clock = clock.clock();

    let agent = Agent::new(settings, db, Arc::clone(&network), Arc::clone(&host));
    Fixture {
      handle: agent.spawn(),
      network,
      host,
      clock,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(Arc::new(Database::open_in_memory().unwrap()), "v1")
  }

  fn routed(intercepted: Intercepted) -> Routed {
    match intercepted {
      Intercepted::Handled(Ok(routed)) => routed,
      other => panic!("expected a routed response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_requests_bypass_until_activated() {
    let f = fixture();
    let request = Request::get(url("/dashboard"));

    assert!(matches!(
      f.handle.fetch(request.clone()).await.unwrap(),
      Intercepted::Bypass
    ));

    assert_eq!(f.handle.start().await.unwrap(), LifecycleState::Activated);
    f.network.respond(url("/dashboard").as_str(), Response::new(200, "dash"));
    let routed = routed(f.handle.fetch(request).await.unwrap());
    assert_eq!(routed.source, RouteSource::Network);
  }

  #[tokio::test]
  async fn test_non_get_bypasses() {
    let f = fixture();
    f.handle.start().await.unwrap();

    let post = Request::new(Method::POST, url("/api/albums"));
    assert!(matches!(
      f.handle.fetch(post).await.unwrap(),
      Intercepted::Bypass
    ));
  }

  #[tokio::test]
  async fn test_offline_root_served_from_precache() {
    let f = fixture();
    f.handle.start().await.unwrap();
    f.network.set_online(false);

    let routed = routed(f.handle.fetch(Request::get(url("/"))).await.unwrap());

    assert_eq!(routed.source, RouteSource::CacheFresh);
    assert_eq!(routed.response.text(), "static /");
  }

  #[tokio::test]
  async fn test_offline_unknown_page_gets_offline_page() {
    let f = fixture();
    f.handle.start().await.unwrap();
    f.network.set_online(false);

    let routed = routed(
      f.handle
        .fetch(Request::get(url("/settings/privacy")))
        .await
        .unwrap(),
    );

    assert_eq!(routed.source, RouteSource::OfflinePage);
    assert_eq!(routed.response.text(), "static /offline.html");
  }

  #[tokio::test]
  async fn test_enqueue_then_sync_round_trip() {
    let f = fixture();
    f.handle.start().await.unwrap();
    let mut tab = f.handle.connect(url("/albums").as_str()).await.unwrap();

    f.network.set_online(false);
    let id = f
      .handle
      .enqueue(
        ResourceType::Album,
        Mutation::new("POST", url("/api/albums").as_str(), json!({ "title": "Fjords" })),
      )
      .await
      .unwrap();
    assert_eq!(f.handle.queue_counts().await.unwrap().albums, 1);

    f.network.set_online(true);
    f.network.respond(url("/api/albums").as_str(), Response::new(201, "{}"));
    let report = f
      .handle
      .sync("background-sync-albums")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(report.replayed, vec![id]);

    match tab.events.recv().await.unwrap() {
      ClientEvent::Message(AgentMessage::AlbumSynced(item)) => assert_eq!(item.id, id),
      other => panic!("unexpected event: {:?}", other),
    }

    let again = f
      .handle
      .sync("background-sync-albums")
      .await
      .unwrap()
      .unwrap();
    assert!(again.replayed.is_empty());
    assert!(tab.events.try_recv().is_err());
    assert_eq!(f.handle.queue_counts().await.unwrap().total(), 0);
  }

  #[tokio::test]
  async fn test_unknown_sync_tag_is_ignored() {
    let f = fixture();
    assert_eq!(f.handle.sync("background-sync-likes").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_queue_survives_agent_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");

    {
      let f = fixture_with(Arc::new(Database::open(&path).unwrap()), "v1");
      f.handle
        .enqueue(
          ResourceType::Photo,
          Mutation::new("POST", url("/api/photos").as_str(), json!({ "caption": "dune" })),
        )
        .await
        .unwrap();
    }

    let f = fixture_with(Arc::new(Database::open(&path).unwrap()), "v1");
    let pending = f.handle.pending(ResourceType::Photo).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, json!({ "caption": "dune" }));
  }

  #[tokio::test]
  async fn test_version_upgrade_drops_old_partitions() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let old = fixture_with(Arc::clone(&db), "v1");
    old.handle.start().await.unwrap();
    old
      .network
      .respond(url("/dashboard").as_str(), Response::new(200, "v1 dashboard"));
    old
      .handle
      .fetch(Request::get(url("/dashboard")))
      .await
      .unwrap();

    let new = fixture_with(Arc::clone(&db), "v2");
    new.handle.start().await.unwrap();
    new.network.set_online(false);

    // Only v2's precache survives; the v1 dashboard is gone
    let routed = routed(
      new
        .handle
        .fetch(Request::get(url("/dashboard")))
        .await
        .unwrap(),
    );
    assert_eq!(routed.source, RouteSource::OfflinePage);

    let storage = SqliteStorage::new(db);
    let mut partitions = crate::cache::CacheStorage::partitions(&storage).unwrap();
    partitions.sort();
    assert_eq!(
      partitions,
      vec!["api-v2", "dynamic-v2", "image-v2", "static-v2"]
    );
  }

  #[tokio::test]
  async fn test_deferred_update_activates_on_skip_waiting() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    for path in DEFAULT_PRECACHE {
      network.respond(url(path).as_str(), Response::new(200, "static"));
    }
    let mut settings = AgentSettings::new(Url::parse(ORIGIN).unwrap(), "v2");
    settings.activate_immediately = false;
    let handle = Agent::new(settings, db, network, Arc::new(RecordingHost::default())).spawn();
    let mut tab = handle.connect(ORIGIN).await.unwrap();

    assert_eq!(handle.start().await.unwrap(), LifecycleState::Waiting);
    assert_eq!(
      tab.events.recv().await.unwrap(),
      ClientEvent::UpdateAvailable {
        version: "v2".into()
      }
    );

    handle.post_message(r#"{"type":"SKIP_WAITING"}"#).await.unwrap();
    assert_eq!(
      tab.events.recv().await.unwrap(),
      ClientEvent::ControllerChanged {
        version: "v2".into()
      }
    );
  }

  #[tokio::test]
  async fn test_clear_cache_command() {
    let f = fixture();
    f.handle.start().await.unwrap();

    f.handle.send_command(ClientCommand::ClearCache).await.unwrap();
    f.network.set_online(false);

    let routed = routed(f.handle.fetch(Request::get(url("/"))).await.unwrap());
    assert_eq!(routed.source, RouteSource::Fallback);
  }

  #[tokio::test]
  async fn test_push_with_empty_payload_uses_defaults() {
    let f = fixture();

    let notification = f.handle.push(Some(b"{}".to_vec())).await.unwrap();

    let defaults = NotificationDefaults::default();
    assert_eq!(notification.title, defaults.title);
    assert_eq!(notification.body, defaults.body);
    assert_eq!(notification.icon, defaults.icon);
    assert_eq!(notification.badge, defaults.badge);
    assert_eq!(notification.tag, defaults.tag);
    assert_eq!(f.host.shown(), vec![notification]);
  }

  #[tokio::test]
  async fn test_view_click_focuses_open_client() {
    let f = fixture();
    let mut tab = f.handle.connect(ORIGIN).await.unwrap();

    f.handle
      .notification_click("waypost-notification", Some("view"))
      .await
      .unwrap();

    assert_eq!(
      tab.events.recv().await.unwrap(),
      ClientEvent::Navigate {
        url: url("/dashboard").to_string()
      }
    );
    assert!(f.host.opened().is_empty());
    assert_eq!(f.host.closed(), vec!["waypost-notification".to_string()]);
  }

  #[tokio::test]
  async fn test_view_click_without_clients_opens_window() {
    let f = fixture();

    f.handle.notification_click("t", None).await.unwrap();

    assert_eq!(f.host.opened(), vec![url("/dashboard").to_string()]);
  }

  #[tokio::test]
  async fn test_dismiss_click_only_closes() {
    let f = fixture();
    let mut tab = f.handle.connect(ORIGIN).await.unwrap();

    f.handle.notification_click("t", Some("dismiss")).await.unwrap();

    assert_eq!(f.host.closed(), vec!["t".to_string()]);
    assert!(f.host.opened().is_empty());
    assert!(tab.events.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_api_cache_expires_through_agent_clock() {
    let f = fixture();
    f.handle.start().await.unwrap();
    f.network.respond(url("/api/albums").as_str(), Response::new(200, "[]"));
    f.handle
      .fetch(Request::get(url("/api/albums")))
      .await
      .unwrap();

    f.network.set_online(false);
    f.clock.advance(chrono::Duration::minutes(5));

    assert!(matches!(
      f.handle
        .fetch(Request::get(url("/api/albums")))
        .await
        .unwrap(),
      Intercepted::Handled(Err(FetchError::Network(_)))
    ));
  }
}
