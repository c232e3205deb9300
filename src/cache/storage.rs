//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::sync::Mutex;

use super::traits::{Generation, RequestIdentity};
use crate::db::Database;
use crate::http::{Response, ResponseKind};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Every method is one self-contained transaction.
pub trait CacheStorage: Send + Sync + 'static {
  /// Add a generation to the live set (no-op if already present).
  fn open_generation(&self, generation: &Generation) -> Result<()>;

  /// Delete a generation and all of its entries.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Names of every live generation, oldest first.
  fn generations(&self) -> Result<Vec<String>>;

  /// Look up an entry in a generation.
  fn get_entry(
    &self,
    generation: &Generation,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedEntry>>;

  /// Insert or overwrite an entry, opening the generation if needed.
  fn store_entry(
    &self,
    generation: &Generation,
    identity: &RequestIdentity,
    response: &Response,
  ) -> Result<()>;

  /// Insert every entry and open the generation, or write nothing at all.
  fn store_entries(
    &self,
    generation: &Generation,
    entries: &[(RequestIdentity, Response)],
  ) -> Result<()>;

  /// (method, url) of every entry in a generation.
  fn keys(&self, generation: &Generation) -> Result<Vec<(String, String)>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  pub fn open(db: &Database) -> Result<Self> {
    Ok(Self {
      conn: Mutex::new(db.connect()?),
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, generation: &Generation) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation.name()],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;

    Ok(())
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Explicit entry delete so eviction does not depend on the foreign key pragma
    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    Ok(names)
  }

  fn get_entry(
    &self,
    generation: &Generation,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, kind, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND entry_key = ?",
        params![generation.name(), identity.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", identity.url, e))?;

    let Some((status, kind, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let kind = ResponseKind::parse(&kind)
      .ok_or_else(|| eyre!("Unknown response kind '{}' for {}", kind, identity.url))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

    Ok(Some(CachedEntry {
      response: Response {
        status,
        kind,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn store_entry(
    &self,
    generation: &Generation,
    identity: &RequestIdentity,
    response: &Response,
  ) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    open_in(&tx, generation)?;
    insert_entry(&tx, generation, identity, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn store_entries(
    &self,
    generation: &Generation,
    entries: &[(RequestIdentity, Response)],
  ) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction on any error rolls the whole batch back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    open_in(&tx, generation)?;
    for (identity, response) in entries {
      insert_entry(&tx, generation, identity, response)?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, generation: &Generation) -> Result<Vec<(String, String)>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE generation = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![generation.name()], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<(String, String)>>>()
      .map_err(|e| eyre!("Failed to read cache key row: {}", e))?;

    Ok(keys)
  }
}

fn open_in(tx: &Transaction, generation: &Generation) -> Result<()> {
  tx.execute(
    "INSERT OR IGNORE INTO generations (name) VALUES (?)",
    params![generation.name()],
  )
  .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;
  Ok(())
}

fn insert_entry(
  tx: &Transaction,
  generation: &Generation,
  identity: &RequestIdentity,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  tx.execute(
    "INSERT OR REPLACE INTO cache_entries
       (generation, entry_key, method, url, status, kind, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      generation.name(),
      identity.cache_key(),
      identity.method.as_str(),
      identity.url.as_str(),
      response.status,
      response.kind.as_str(),
      headers,
      response.body,
    ],
  )
  .map_err(|e| eyre!("Failed to store {}: {}", identity.url, e))?;
  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
