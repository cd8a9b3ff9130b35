//! Core types for the partitioned response cache.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::http::Response;

/// Source of "now" for capture timestamps and freshness checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
  Arc::new(Utc::now)
}

/// What a partition holds. Each purpose has its own retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
  Static,
  Dynamic,
  Image,
  Api,
}

impl Purpose {
  /// Lookup order used when matching across every partition.
  pub const ALL: [Purpose; 4] = [
    Purpose::Static,
    Purpose::Dynamic,
    Purpose::Image,
    Purpose::Api,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Purpose::Static => "static",
      Purpose::Dynamic => "dynamic",
      Purpose::Image => "image",
      Purpose::Api => "api",
    }
  }
}

impl fmt::Display for Purpose {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Max age per purpose. Entries older than this are treated as misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
  pub static_assets: Duration,
  pub dynamic: Duration,
  pub image: Duration,
  pub api: Duration,
}

impl Retention {
  pub fn max_age(&self, purpose: Purpose) -> Duration {
    match purpose {
      Purpose::Static => self.static_assets,
      Purpose::Dynamic => self.dynamic,
      Purpose::Image => self.image,
      Purpose::Api => self.api,
    }
  }
}

impl Default for Retention {
  fn default() -> Self {
    Self {
      static_assets: Duration::days(30),
      dynamic: Duration::hours(6),
      image: Duration::days(90),
      api: Duration::minutes(2),
    }
  }
}

/// Identity of a cached request: (method, url).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &str) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A stored response and when it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub response: Response,
  pub captured_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.captured_at
  }

  pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
    self.age(now) <= max_age
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_retention() {
    let retention = Retention::default();
    assert_eq!(retention.max_age(Purpose::Static), Duration::days(30));
    assert_eq!(retention.max_age(Purpose::Dynamic), Duration::hours(6));
    assert_eq!(retention.max_age(Purpose::Image), Duration::days(90));
    assert_eq!(retention.max_age(Purpose::Api), Duration::minutes(2));
  }

  #[test]
  fn test_cache_hash_is_stable_and_method_normalized() {
    let a = RequestKey::new("get", "https://waypost.app/dashboard");
    let b = RequestKey::new("GET", "https://waypost.app/dashboard");
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }

  #[test]
  fn test_freshness_boundary() {
    let captured_at = Utc::now();
    let entry = CachedResponse {
      response: Response::new(200, "ok"),
      captured_at,
    };
    let max_age = Duration::minutes(2);
    assert!(entry.is_fresh(max_age, captured_at + Duration::minutes(2)));
    assert!(!entry.is_fresh(max_age, captured_at + Duration::seconds(121)));
  }
}
