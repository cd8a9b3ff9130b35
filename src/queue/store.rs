//! Durable storage for queued mutations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Row};
use std::sync::Arc;

use super::{Mutation, QueueCounts, QueuedMutation, ResourceType};
use crate::cache::{format_datetime, parse_datetime};
use crate::db::Database;

/// Trait for queue storage backends.
pub trait QueueStore: Send + Sync + 'static {
  /// Append a mutation; returns its id. Ids grow monotonically.
  fn insert(
    &self,
    resource: ResourceType,
    mutation: &Mutation,
    enqueued_at: DateTime<Utc>,
  ) -> Result<i64>;

  /// Queued items of one resource type, oldest first.
  fn pending(&self, resource: ResourceType) -> Result<Vec<QueuedMutation>>;

  /// Bump the attempt count before a replay.
  fn record_attempt(&self, id: i64) -> Result<()>;

  /// Remember why the last replay failed.
  fn record_failure(&self, id: i64, error: &str) -> Result<()>;

  /// Remove an item. Returns false if it was already gone.
  fn remove(&self, id: i64) -> Result<bool>;

  fn counts(&self) -> Result<QueueCounts>;
}

/// SQLite-based queue storage; shares the agent database.
pub struct SqliteQueueStore {
  db: Arc<Database>,
}

impl SqliteQueueStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl QueueStore for SqliteQueueStore {
  fn insert(
    &self,
    resource: ResourceType,
    mutation: &Mutation,
    enqueued_at: DateTime<Utc>,
  ) -> Result<i64> {
    let conn = self.db.conn()?;
    let payload = serde_json::to_string(&mutation.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO mutation_queue (resource, method, url, payload, enqueued_at, attempts)
         VALUES (?, ?, ?, ?, ?, 0)",
        params![
          resource.as_str(),
          mutation.method,
          mutation.url,
          payload,
          format_datetime(enqueued_at),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self, resource: ResourceType) -> Result<Vec<QueuedMutation>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, payload, enqueued_at, attempts, last_error
         FROM mutation_queue WHERE resource = ? ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<RawRow> = stmt
      .query_map(params![resource.as_str()], RawRow::from_row)
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    rows.into_iter().map(|row| row.into_item(resource)).collect()
  }

  fn record_attempt(&self, id: i64) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE mutation_queue SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to record attempt for {}: {}", id, e))?;
    Ok(())
  }

  fn record_failure(&self, id: i64, error: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE mutation_queue SET last_error = ? WHERE id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to record failure for {}: {}", id, e))?;
    Ok(())
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM mutation_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn counts(&self) -> Result<QueueCounts> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT resource, COUNT(*) FROM mutation_queue GROUP BY resource")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let mut counts = QueueCounts::default();
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    for row in rows.filter_map(|r| r.ok()) {
      match row.0.parse::<ResourceType>() {
        Ok(ResourceType::Album) => counts.albums = row.1 as usize,
        Ok(ResourceType::Photo) => counts.photos = row.1 as usize,
        Err(_) => {}
      }
    }

    Ok(counts)
  }
}

/// Row as stored, before the payload and timestamp are parsed.
struct RawRow {
  id: i64,
  method: String,
  url: String,
  payload: String,
  enqueued_at: String,
  attempts: u32,
  last_error: Option<String>,
}

impl RawRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      method: row.get(1)?,
      url: row.get(2)?,
      payload: row.get(3)?,
      enqueued_at: row.get(4)?,
      attempts: row.get(5)?,
      last_error: row.get(6)?,
    })
  }

  fn into_item(self, resource: ResourceType) -> Result<QueuedMutation> {
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Failed to deserialize payload of {}: {}", self.id, e))?;
    Ok(QueuedMutation {
      id: self.id,
      resource,
      method: self.method,
      url: self.url,
      payload,
      enqueued_at: parse_datetime(&self.enqueued_at)?,
      attempts: self.attempts,
      last_error: self.last_error,
    })
  }
}
