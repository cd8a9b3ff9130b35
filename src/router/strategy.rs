//! Fetch strategies, one per request class.

use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::classify::{Classifier, RequestClass};
use crate::cache::{CacheStorage, CacheTiers, CachedResponse, Purpose, RequestKey};
use crate::http::{FetchError, Network, Request, Response};

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
  /// Fresh data from network
  Network,
  /// Cached entry within its freshness window
  CacheFresh,
  /// Network unavailable, serving an entry past its freshness window
  CacheStale,
  /// Network unavailable, serving a cached app-section root instead of the page asked for
  AppShell,
  /// Network unavailable, serving the offline page
  OfflinePage,
  /// Nothing cached at all; synthesized 503
  Fallback,
}

/// Result of routing a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct Routed {
  pub response: Response,
  pub source: RouteSource,
}

impl Routed {
  fn new(response: Response, source: RouteSource) -> Self {
    Self { response, source }
  }

  fn fallback() -> Self {
    Self::new(Response::offline_fallback(), RouteSource::Fallback)
  }
}

/// Where navigations fall back to when the network and exact cache both miss.
#[derive(Debug, Clone)]
pub struct NavigationFallbacks {
  /// Root paths of the app's sections, tried in order
  pub app_sections: Vec<String>,
  pub offline_page: String,
}

/// Classifies requests and runs the matching strategy against the cache tiers.
pub struct Router<S: CacheStorage, N: Network> {
  tiers: Arc<CacheTiers<S>>,
  network: Arc<N>,
  classifier: Classifier,
  fallbacks: NavigationFallbacks,
}

impl<S: CacheStorage, N: Network> Router<S, N> {
  pub fn new(
    tiers: Arc<CacheTiers<S>>,
    network: Arc<N>,
    classifier: Classifier,
    fallbacks: NavigationFallbacks,
  ) -> Self {
    Self {
      tiers,
      network,
      classifier,
      fallbacks,
    }
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    self.classifier.classify(&request.url)
  }

  /// Route one request.
  ///
  /// Only the API strategy can return `Err`; every other class resolves to
  /// some response, down to the synthesized 503.
  pub async fn handle(&self, request: &Request) -> Result<Routed, FetchError> {
    let class = self.classify(request);
    debug!(url = %request.url, ?class, "Routing request");

    match class {
      RequestClass::Image => Ok(self.cache_first(request, Purpose::Image, true).await),
      RequestClass::StaticAsset => Ok(self.cache_first(request, Purpose::Static, false).await),
      RequestClass::Api => self.network_first_api(request).await,
      RequestClass::Navigation => Ok(self.network_first_navigation(request).await),
    }
  }

  /// Cache-first.
  ///
  /// 1. Cached entry (fresh, when `check_freshness`) is returned immediately
  /// 2. Otherwise fetch from network and store successful responses
  /// 3. On network failure, serve whatever is cached, however old
  async fn cache_first(&self, request: &Request, purpose: Purpose, check_freshness: bool) -> Routed {
    let key = request.key();
    let cached = self.lookup(purpose, &key);

    if let Some(entry) = &cached {
      if !check_freshness || self.tiers.is_fresh(purpose, entry) {
        return Routed::new(entry.response.clone(), RouteSource::CacheFresh);
      }
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(purpose, &key, &response);
        Routed::new(response, RouteSource::Network)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed for cache-first request");
        match cached {
          Some(entry) => Routed::new(entry.response, RouteSource::CacheStale),
          None => Routed::fallback(),
        }
      }
    }
  }

  /// Network-first for API calls; only a fresh cached entry may stand in.
  async fn network_first_api(&self, request: &Request) -> Result<Routed, FetchError> {
    let key = request.key();

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(Purpose::Api, &key, &response);
        Ok(Routed::new(response, RouteSource::Network))
      }
      Err(e) => {
        let fresh = self
          .lookup(Purpose::Api, &key)
          .filter(|entry| self.tiers.is_fresh(Purpose::Api, entry));
        match fresh {
          Some(entry) => {
            debug!(url = %request.url, "Serving cached API response while offline");
            Ok(Routed::new(entry.response, RouteSource::CacheFresh))
          }
          None => {
            warn!(url = %request.url, error = %e, "API request failed with no usable cache");
            Err(e)
          }
        }
      }
    }
  }

  /// Network-first for page loads, with a chain of offline fallbacks.
  ///
  /// Offline, the first cached match wins: the exact URL (fresh preferred),
  /// then each app-section root, then the offline page. Age does not rule a
  /// match out; the 503 is only synthesized when none of them is cached.
  async fn network_first_navigation(&self, request: &Request) -> Routed {
    let key = request.key();

    let error = match self.network.fetch(request).await {
      Ok(response) => {
        self.store(Purpose::Dynamic, &key, &response);
        return Routed::new(response, RouteSource::Network);
      }
      Err(e) => e,
    };
    warn!(url = %request.url, error = %error, "Navigation failed, falling back to cache");

    if let Some((entry, fresh)) = self.match_best(&key) {
      let source = if fresh {
        RouteSource::CacheFresh
      } else {
        RouteSource::CacheStale
      };
      return Routed::new(entry.response, source);
    }

    for section in &self.fallbacks.app_sections {
      if let Some(entry) = self.match_path(&request.url, section) {
        debug!(section = %section, "Serving app section shell");
        return Routed::new(entry.response, RouteSource::AppShell);
      }
    }

    if let Some(entry) = self.match_path(&request.url, &self.fallbacks.offline_page) {
      return Routed::new(entry.response, RouteSource::OfflinePage);
    }

    Routed::fallback()
  }

  /// Cached entry for `path` on the request's origin, however old.
  fn match_path(&self, base: &Url, path: &str) -> Option<CachedResponse> {
    let url = base.join(path).ok()?;
    self
      .match_best(&RequestKey::new("GET", url.as_str()))
      .map(|(entry, _)| entry)
  }

  fn match_best(&self, key: &RequestKey) -> Option<(CachedResponse, bool)> {
    match self.tiers.match_best(key) {
      Ok(found) => found.map(|(_, entry, fresh)| (entry, fresh)),
      Err(e) => {
        warn!(url = %key.url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Storage errors are treated as misses.
  fn lookup(&self, purpose: Purpose, key: &RequestKey) -> Option<CachedResponse> {
    match self.tiers.get(purpose, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %key.url, partition = %purpose, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Only successful responses are stored; write failures are logged and dropped.
  fn store(&self, purpose: Purpose, key: &RequestKey, response: &Response) {
    if !response.is_success() {
      return;
    }
    if let Err(e) = self.tiers.put(purpose, key, response) {
      warn!(url = %key.url, partition = %purpose, error = %e, "Cache write failed");
    }
  }
}
