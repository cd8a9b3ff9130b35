//! Versioned cache partitions with per-purpose retention.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info};

use super::storage::CacheStorage;
use super::traits::{system_clock, CachedResponse, Clock, Purpose, RequestKey, Retention};
use crate::http::Response;

/// Configuration handed to the tier manager at construction time.
#[derive(Debug, Clone)]
pub struct TierConfig {
  /// Version token embedded in every partition name
  pub version: String,
  pub retention: Retention,
  /// Optional bound per partition; oldest entries are pruned past it
  pub max_entries_per_partition: Option<usize>,
}

impl TierConfig {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
      retention: Retention::default(),
      max_entries_per_partition: None,
    }
  }
}

/// Owns the four partitions of the current version.
///
/// Reads never judge freshness on their own (`get`); callers that care use
/// `get_fresh` or `is_fresh`. Expired entries stay on disk until they are
/// overwritten or their partition is swept.
pub struct CacheTiers<S: CacheStorage> {
  storage: Arc<S>,
  config: TierConfig,
  clock: Clock,
}

impl<S: CacheStorage> CacheTiers<S> {
  pub fn new(storage: Arc<S>, config: TierConfig) -> Self {
    Self {
      storage,
      config,
      clock: system_clock(),
    }
  }

  pub fn with_clock(mut self, clock: Clock) -> Self {
    self.clock = clock;
    self
  }

  pub fn now(&self) -> DateTime<Utc> {
    (self.clock)()
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  pub fn partition_name(&self, purpose: Purpose) -> String {
    format!("{}-{}", purpose, self.config.version)
  }

  /// The partition set of the current version.
  pub fn current_partitions(&self) -> Vec<String> {
    Purpose::ALL
      .iter()
      .map(|p| self.partition_name(*p))
      .collect()
  }

  /// Whether the current version's partition for `purpose` exists in storage.
  pub fn has_partition(&self, purpose: Purpose) -> Result<bool> {
    let name = self.partition_name(purpose);
    Ok(self.storage.partitions()?.contains(&name))
  }

  /// Store a response, stamped with the current time.
  pub fn put(&self, purpose: Purpose, key: &RequestKey, response: &Response) -> Result<()> {
    let partition = self.partition_name(purpose);
    let entry = CachedResponse {
      response: response.clone(),
      captured_at: self.now(),
    };
    self.storage.put(&partition, key, &entry)?;

    if let Some(limit) = self.config.max_entries_per_partition {
      let pruned = self.storage.prune_oldest(&partition, limit)?;
      if pruned > 0 {
        debug!(partition = %partition, pruned, "Pruned oldest cache entries");
      }
    }

    Ok(())
  }

  /// Stored entry, regardless of age.
  pub fn get(&self, purpose: Purpose, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.storage.get(&self.partition_name(purpose), key)
  }

  /// Stored entry, only if still within its partition's max age.
  pub fn get_fresh(&self, purpose: Purpose, key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(
      self
        .get(purpose, key)?
        .filter(|entry| self.is_fresh(purpose, entry)),
    )
  }

  pub fn is_fresh(&self, purpose: Purpose, entry: &CachedResponse) -> bool {
    entry.is_fresh(self.config.retention.max_age(purpose), self.now())
  }

  /// First fresh entry for `key` across every current partition.
  pub fn match_any(&self, key: &RequestKey) -> Result<Option<(Purpose, CachedResponse)>> {
    for purpose in Purpose::ALL {
      if let Some(entry) = self.get_fresh(purpose, key)? {
        return Ok(Some((purpose, entry)));
      }
    }
    Ok(None)
  }

  /// Entry for `key` across every current partition, regardless of age.
  ///
  /// A fresh entry wins over a stale one; among equals the partition order
  /// decides. The flag tells whether the returned entry is still fresh.
  pub fn match_best(&self, key: &RequestKey) -> Result<Option<(Purpose, CachedResponse, bool)>> {
    if let Some((purpose, entry)) = self.match_any(key)? {
      return Ok(Some((purpose, entry, true)));
    }
    for purpose in Purpose::ALL {
      if let Some(entry) = self.get(purpose, key)? {
        return Ok(Some((purpose, entry, false)));
      }
    }
    Ok(None)
  }

  /// Delete every partition that is not part of the current version's set.
  pub fn sweep_stale_versions(&self) -> Result<Vec<String>> {
    let current = self.current_partitions();
    let mut removed = Vec::new();

    for name in self.storage.partitions()? {
      if !current.contains(&name) && self.storage.delete_partition(&name)? {
        info!(partition = %name, "Deleted stale cache partition");
        removed.push(name);
      }
    }

    Ok(removed)
  }

  /// Delete the current version's partition for `purpose`.
  pub fn drop_partition(&self, purpose: Purpose) -> Result<bool> {
    self.storage.delete_partition(&self.partition_name(purpose))
  }

  /// Delete every partition, current version included.
  pub fn clear_all(&self) -> Result<usize> {
    let mut removed = 0;
    for name in self.storage.partitions()? {
      if self.storage.delete_partition(&name)? {
        removed += 1;
      }
    }
    info!(removed, "Cleared all cache partitions");
    Ok(removed)
  }

  pub fn entry_count(&self, purpose: Purpose) -> Result<usize> {
    self.storage.entry_count(&self.partition_name(purpose))
  }

  /// Make sure every partition of the current version exists.
  pub fn open_current(&self) -> Result<()> {
    for name in self.current_partitions() {
      self.storage.open_partition(&name)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::testing::ManualClock;
  use chrono::Duration;

  fn tiers(db: &Arc<Database>, version: &str) -> CacheTiers<SqliteStorage> {
    CacheTiers::new(
      Arc::new(SqliteStorage::new(Arc::clone(db))),
      TierConfig::new(version),
    )
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::new("GET", &format!("https://waypost.app{}", path))
  }

  #[test]
  fn test_partition_names_embed_version() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let tiers = tiers(&db, "v7");
    assert_eq!(
      tiers.current_partitions(),
      vec!["static-v7", "dynamic-v7", "image-v7", "api-v7"]
    );
  }

  #[test]
  fn test_put_stamps_capture_time_from_clock() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = ManualClock::new();
    let tiers = tiers(&db, "v1").with_clock(clock.clock());

    tiers
      .put(Purpose::Dynamic, &key("/dashboard"), &Response::new(200, "hi"))
      .unwrap();

    let entry = tiers.get(Purpose::Dynamic, &key("/dashboard")).unwrap().unwrap();
    assert_eq!(entry.captured_at, clock.now());
  }

  #[test]
  fn test_expired_entries_are_misses_but_not_deleted() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = ManualClock::new();
    let tiers = tiers(&db, "v1").with_clock(clock.clock());
    let api_key = key("/api/albums");

    tiers
      .put(Purpose::Api, &api_key, &Response::new(200, "[]"))
      .unwrap();
    clock.advance(Duration::minutes(3));

    assert!(tiers.get_fresh(Purpose::Api, &api_key).unwrap().is_none());
    assert!(tiers.get(Purpose::Api, &api_key).unwrap().is_some());
  }

  #[test]
  fn test_version_sweep_removes_prior_partitions() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let old = tiers(&db, "v1");
    old
      .put(Purpose::Static, &key("/"), &Response::new(200, "root"))
      .unwrap();
    old
      .put(Purpose::Image, &key("/a.png"), &Response::new(200, "png"))
      .unwrap();

    let new = tiers(&db, "v2");
    new.open_current().unwrap();
    let mut removed = new.sweep_stale_versions().unwrap();
    removed.sort();

    assert_eq!(removed, vec!["image-v1", "static-v1"]);
    for purpose in Purpose::ALL {
      assert_eq!(new.entry_count(purpose).unwrap(), 0);
    }
    assert!(old.get(Purpose::Static, &key("/")).unwrap().is_none());
  }

  #[test]
  fn test_match_any_prefers_static_then_dynamic() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let tiers = tiers(&db, "v1");
    tiers
      .put(Purpose::Dynamic, &key("/"), &Response::new(200, "dynamic"))
      .unwrap();
    tiers
      .put(Purpose::Static, &key("/"), &Response::new(200, "static"))
      .unwrap();

    let (purpose, entry) = tiers.match_any(&key("/")).unwrap().unwrap();
    assert_eq!(purpose, Purpose::Static);
    assert_eq!(entry.response.text(), "static");
  }

  #[test]
  fn test_match_best_falls_back_to_stale_entries() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = ManualClock::new();
    let tiers = tiers(&db, "v1").with_clock(clock.clock());
    tiers
      .put(Purpose::Static, &key("/offline.html"), &Response::new(200, "offline"))
      .unwrap();
    clock.advance(Duration::days(31));

    assert!(tiers.match_any(&key("/offline.html")).unwrap().is_none());
    let (purpose, entry, fresh) = tiers.match_best(&key("/offline.html")).unwrap().unwrap();
    assert_eq!(purpose, Purpose::Static);
    assert_eq!(entry.response.text(), "offline");
    assert!(!fresh);
  }

  #[test]
  fn test_match_best_prefers_fresh_entry() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = ManualClock::new();
    let tiers = tiers(&db, "v1").with_clock(clock.clock());
    tiers
      .put(Purpose::Api, &key("/"), &Response::new(200, "old api"))
      .unwrap();
    clock.advance(Duration::hours(1));
    tiers
      .put(Purpose::Dynamic, &key("/"), &Response::new(200, "page"))
      .unwrap();

    let (purpose, entry, fresh) = tiers.match_best(&key("/")).unwrap().unwrap();
    assert_eq!(purpose, Purpose::Dynamic);
    assert_eq!(entry.response.text(), "page");
    assert!(fresh);
  }

  #[test]
  fn test_bounded_partition() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = ManualClock::new();
    let mut config = TierConfig::new("v1");
    config.max_entries_per_partition = Some(2);
    let tiers = CacheTiers::new(Arc::new(SqliteStorage::new(Arc::clone(&db))), config)
      .with_clock(clock.clock());

    for path in ["/a", "/b", "/c"] {
      tiers
        .put(Purpose::Dynamic, &key(path), &Response::new(200, path))
        .unwrap();
      clock.advance(Duration::seconds(1));
    }

    assert_eq!(tiers.entry_count(Purpose::Dynamic).unwrap(), 2);
    assert!(tiers.get(Purpose::Dynamic, &key("/a")).unwrap().is_none());
    assert!(tiers.get(Purpose::Dynamic, &key("/c")).unwrap().is_some());
  }

  #[test]
  fn test_clear_all() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let tiers = tiers(&db, "v1");
    tiers.open_current().unwrap();
    tiers
      .put(Purpose::Api, &key("/api/me"), &Response::new(200, "{}"))
      .unwrap();

    assert_eq!(tiers.clear_all().unwrap(), 4);
    assert!(!tiers.has_partition(Purpose::Api).unwrap());
  }
}
