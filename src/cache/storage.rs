//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::traits::{CachedResponse, RequestKey};
use crate::db::Database;
use crate::http::Response;

/// Trait for cache storage backends.
///
/// Partitions are flat namespaces; the storage layer has no notion of
/// versions or freshness.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// Names of every partition currently stored.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition and all its entries. Returns false if it did not exist.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Store an entry, replacing any previous one for the same key.
  fn put(&self, partition: &str, key: &RequestKey, entry: &CachedResponse) -> Result<()>;

  /// Get an entry by key.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Number of entries in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;

  /// Delete the oldest-captured entries so at most `keep` remain.
  /// Returns the number of entries removed.
  fn prune_oldest(&self, partition: &str, keep: usize) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
        params![name, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, partition: &str, key: &RequestKey, entry: &CachedResponse) -> Result<()> {
    let mut conn = self.db.conn()?;
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![partition, format_datetime(entry.captured_at)],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    // Whole-row replace: concurrent writers to the same key end up last-write-wins
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, key_hash, method, url, status, headers, body, captured_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key.cache_hash(),
        key.method,
        key.url,
        entry.response.status,
        headers,
        entry.response.body,
        format_datetime(entry.captured_at),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, captured_at FROM cache_entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((status, headers, body, captured_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          captured_at: parse_datetime(&captured_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as usize)
  }

  fn prune_oldest(&self, partition: &str, keep: usize) -> Result<usize> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ?1 AND key_hash NOT IN (
           SELECT key_hash FROM cache_entries WHERE partition = ?1
           ORDER BY captured_at DESC LIMIT ?2
         )",
        params![partition, keep as i64],
      )
      .map_err(|e| eyre!("Failed to prune partition {}: {}", partition, e))?;
    Ok(removed)
  }
}

/// Timestamps are stored as RFC 3339 in UTC with fixed precision so they sort as text.
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn entry(body: &str, captured_at: DateTime<Utc>) -> CachedResponse {
    CachedResponse {
      response: Response::new(200, body).with_header("content-type", "text/html"),
      captured_at,
    }
  }

  #[test]
  fn test_put_get_roundtrip_preserves_headers_and_timestamp() {
    let storage = storage();
    let key = RequestKey::new("GET", "https://waypost.app/albums");
    let stored = entry("<html>albums</html>", Utc::now());

    storage.put("dynamic-v1", &key, &stored).unwrap();
    let loaded = storage.get("dynamic-v1", &key).unwrap().unwrap();

    assert_eq!(loaded.response, stored.response);
    assert_eq!(
      format_datetime(loaded.captured_at),
      format_datetime(stored.captured_at)
    );
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let storage = storage();
    let key = RequestKey::new("GET", "https://waypost.app/albums");

    storage.put("dynamic-v1", &key, &entry("old", Utc::now())).unwrap();
    storage.put("dynamic-v1", &key, &entry("new", Utc::now())).unwrap();

    let loaded = storage.get("dynamic-v1", &key).unwrap().unwrap();
    assert_eq!(loaded.response.text(), "new");
    assert_eq!(storage.entry_count("dynamic-v1").unwrap(), 1);
  }

  #[test]
  fn test_partitions_are_isolated() {
    let storage = storage();
    let key = RequestKey::new("GET", "https://waypost.app/logo.png");

    storage.put("image-v1", &key, &entry("png", Utc::now())).unwrap();

    assert!(storage.get("image-v2", &key).unwrap().is_none());
  }

  #[test]
  fn test_delete_partition_removes_entries() {
    let storage = storage();
    let key = RequestKey::new("GET", "https://waypost.app/");
    storage.put("static-v1", &key, &entry("root", Utc::now())).unwrap();

    assert!(storage.delete_partition("static-v1").unwrap());
    assert!(!storage.delete_partition("static-v1").unwrap());
    assert!(storage.partitions().unwrap().is_empty());
    assert!(storage.get("static-v1", &key).unwrap().is_none());
  }

  #[test]
  fn test_prune_keeps_newest() {
    let storage = storage();
    let now = Utc::now();
    for i in 0..5 {
      let key = RequestKey::new("GET", &format!("https://waypost.app/p/{}", i));
      storage
        .put("dynamic-v1", &key, &entry("page", now + Duration::seconds(i)))
        .unwrap();
    }

    assert_eq!(storage.prune_oldest("dynamic-v1", 2).unwrap(), 3);
    assert_eq!(storage.entry_count("dynamic-v1").unwrap(), 2);

    let newest = RequestKey::new("GET", "https://waypost.app/p/4");
    let oldest = RequestKey::new("GET", "https://waypost.app/p/0");
    assert!(storage.get("dynamic-v1", &newest).unwrap().is_some());
    assert!(storage.get("dynamic-v1", &oldest).unwrap().is_none());
  }
}
