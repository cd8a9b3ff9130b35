//! Test doubles shared across module tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::agent::AgentHost;
use crate::bridge::{ConnectionQuality, HostPlatform, InstallOutcome, Permission, ShareData};
use crate::cache::Clock;
use crate::http::{FetchError, Network, Request, Response};
use crate::push::Notification;

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new() -> Self {
    let start = Utc
      .with_ymd_and_hms(2026, 10, 15, 12, 0, 0)
      .single()
      .expect("valid start time");
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  pub fn clock(&self) -> Clock {
    let now = Arc::clone(&self.now);
    Arc::new(move || *now.lock().unwrap())
  }

  pub fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }

  pub fn advance(&self, by: Duration) {
    *self.now.lock().unwrap() += by;
  }
}

/// Scripted network. Unknown URLs answer 404; every attempt is recorded,
/// including the ones made while offline.
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  online: AtomicBool,
  delay: Mutex<Option<std::time::Duration>>,
  requests: Mutex<Vec<Request>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      delay: Mutex::new(None),
      requests: Mutex::new(Vec::new()),
    }
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: std::time::Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.requests.lock().unwrap().push(request.clone());

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::Network("offline".to_string()));
    }

    let response = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "")))
  }
}

/// Agent host that records what it was asked to do.
#[derive(Default)]
pub struct RecordingHost {
  shown: Mutex<Vec<Notification>>,
  closed: Mutex<Vec<String>>,
  opened: Mutex<Vec<String>>,
}

impl RecordingHost {
  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }

  pub fn closed(&self) -> Vec<String> {
    self.closed.lock().unwrap().clone()
  }

  pub fn opened(&self) -> Vec<String> {
    self.opened.lock().unwrap().clone()
  }
}

#[async_trait]
impl AgentHost for RecordingHost {
  async fn show_notification(&self, notification: &Notification) -> Result<()> {
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }

  async fn close_notification(&self, tag: &str) {
    self.closed.lock().unwrap().push(tag.to_string());
  }

  async fn open_window(&self, url: &str) -> Result<()> {
    self.opened.lock().unwrap().push(url.to_string());
    Ok(())
  }
}

/// Page-side platform with knobs for every capability.
pub struct FakePlatform {
  pub standalone: AtomicBool,
  pub can_share: AtomicBool,
  pub install_outcome: Mutex<InstallOutcome>,
  pub permission: Mutex<Permission>,
  /// What the next permission prompt answers
  pub permission_answer: Mutex<Permission>,
  shared: Mutex<Vec<ShareData>>,
  synced_tags: Mutex<Vec<String>>,
  navigations: Mutex<Vec<String>>,
  reloads: Mutex<usize>,
}

impl FakePlatform {
  pub fn new() -> Self {
    Self {
      standalone: AtomicBool::new(false),
      can_share: AtomicBool::new(true),
      install_outcome: Mutex::new(InstallOutcome::Accepted),
      permission: Mutex::new(Permission::Default),
      permission_answer: Mutex::new(Permission::Granted),
      shared: Mutex::new(Vec::new()),
      synced_tags: Mutex::new(Vec::new()),
      navigations: Mutex::new(Vec::new()),
      reloads: Mutex::new(0),
    }
  }

  pub fn shared(&self) -> Vec<ShareData> {
    self.shared.lock().unwrap().clone()
  }

  pub fn synced_tags(&self) -> Vec<String> {
    self.synced_tags.lock().unwrap().clone()
  }

  pub fn navigations(&self) -> Vec<String> {
    self.navigations.lock().unwrap().clone()
  }

  pub fn reloads(&self) -> usize {
    *self.reloads.lock().unwrap()
  }
}

#[async_trait]
impl HostPlatform for FakePlatform {
  fn is_standalone(&self) -> bool {
    self.standalone.load(Ordering::SeqCst)
  }

  fn is_online(&self) -> bool {
    true
  }

  fn connection_quality(&self) -> ConnectionQuality {
    ConnectionQuality::Fast
  }

  fn can_share(&self) -> bool {
    self.can_share.load(Ordering::SeqCst)
  }

  fn notification_permission(&self) -> Permission {
    *self.permission.lock().unwrap()
  }

  async fn prompt_install(&self) -> InstallOutcome {
    *self.install_outcome.lock().unwrap()
  }

  async fn request_notification_permission(&self) -> Permission {
    let answer = *self.permission_answer.lock().unwrap();
    *self.permission.lock().unwrap() = answer;
    answer
  }

  async fn share(&self, data: &ShareData) -> Result<()> {
    if !self.can_share() {
      return Err(eyre!("Sharing is not supported"));
    }
    self.shared.lock().unwrap().push(data.clone());
    Ok(())
  }

  async fn register_sync(&self, tag: &str) -> Result<()> {
    self.synced_tags.lock().unwrap().push(tag.to_string());
    Ok(())
  }

  fn reload(&self) {
    *self.reloads.lock().unwrap() += 1;
  }

  fn navigate(&self, url: &str) {
    self.navigations.lock().unwrap().push(url.to_string());
  }
}
